//! 名册：本次运行可被指派的参与者（加一个不执行任何动作的合成条目）

pub const NO_ACTION_AGENT: &str = "no_action_agent";
pub const NO_ACTION_DESCRIPTION: &str =
    "If for this step no action is needed, you can use this agent to perform no action";

/// 默认的用户代理名
pub const USER_AGENT: &str = "user_proxy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    /// 按参与者顺序构建；`exclude` 为自主模式下移除的用户代理
    pub fn build<I>(participants: I, exclude: Option<&str>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries: Vec<RosterEntry> = participants
            .into_iter()
            .filter(|(name, _)| Some(name.as_str()) != exclude)
            .map(|(name, description)| RosterEntry { name, description })
            .collect();
        entries.push(RosterEntry {
            name: NO_ACTION_AGENT.to_string(),
            description: NO_ACTION_DESCRIPTION.to_string(),
        });
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    /// 团队描述：每行 `name: description`
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.name, e.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
