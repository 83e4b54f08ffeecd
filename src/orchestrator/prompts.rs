//! 提示模板
//!
//! 模板只约定一件事：让模型返回符合给定 schema 的 JSON 对象。最终答案带固定前缀，便于调用方提取。

use crate::plan::{Plan, SentinelStep, Step};

/// 最终答案的固定前缀
pub const FINAL_ANSWER_MARKER: &str = "Final Answer: ";

pub fn wrap_final_answer(answer: &str) -> String {
    format!("{}{}", FINAL_ANSWER_MARKER, answer.trim())
}

/// 从消息文本中取出最终答案
pub fn extract_final_answer(text: &str) -> Option<&str> {
    text.find(FINAL_ANSWER_MARKER)
        .map(|i| text[i + FINAL_ANSWER_MARKER.len()..].trim())
}

pub fn system_message(date: &str) -> String {
    format!(
        "You are the orchestrator of a team of agents. You plan how to solve the user's request, \
         delegate each step to the most suitable team member, track progress, and replan when the \
         plan stops working. Today's date is {date}."
    )
}

fn websites_note(allowed_websites: &[String]) -> String {
    if allowed_websites.is_empty() {
        String::new()
    } else {
        format!(
            "\nAgents may only visit these websites: {}.\n",
            allowed_websites.join(", ")
        )
    }
}

const SENTINEL_STEP_GUIDE: &str = "\
A step that has to wait for or watch something over time (for example \"check every hour \
until the price drops\") must be a sentinel step: add \"step_type\": \"SentinelPlanStep\", a \
\"condition\" (an integer number of repetitions, or a text condition that can be checked) and \
\"sleep_duration\" (seconds between checks). All other steps omit \"step_type\".";

pub fn planning_prompt(
    team: &str,
    schema: &str,
    allowed_websites: &[String],
    sentinel_steps: bool,
) -> String {
    let sentinel = if sentinel_steps { SENTINEL_STEP_GUIDE } else { "" };
    format!(
        "Our team:\n{team}\n{sites}\n\
         Decide whether the request above needs a plan. If it can be answered directly, set \
         \"needs_plan\" to false, put the answer in \"response\" and leave \"steps\" empty. \
         Otherwise write a short plan: each step has a \"title\", \"details\" and the \
         \"agent_name\" of the team member who should do it. {sentinel}\n\n\
         Reply with a JSON object matching this schema and nothing else:\n{schema}",
        sites = websites_note(allowed_websites),
    )
}

pub fn plan_hint(plan_json: &str) -> String {
    format!(
        "A plan for a similar task that worked before. Use it as a hint only:\n{}",
        plan_json
    )
}

pub fn task_ledger(task: &str, team: &str, plan: &str) -> String {
    format!(
        "We are working on the following task:\n{task}\n\n\
         Our team:\n{team}\n\n\
         The plan:\n{plan}"
    )
}

pub fn progress_ledger_prompt(
    task: &str,
    plan: &str,
    step_index: usize,
    team: &str,
    names: &[&str],
    autonomous: bool,
    schema: &str,
) -> String {
    let user_note = if autonomous {
        "Do not ask the user anything; only choose from the names listed."
    } else {
        ""
    };
    format!(
        "Recall the task:\n{task}\n\n\
         The plan:\n{plan}\n\n\
         We are at step {step} of the plan.\n\n\
         Our team:\n{team}\n\n\
         Judge the progress so far: is the current step complete, do we need a new plan, and \
         what is the next instruction and who should carry it out? \"agent_name\" must be one \
         of: {names}. {user_note}\n\
         In \"progress_summary\" summarize everything learned so far that helps with the task.\n\n\
         Reply with a JSON object matching this schema and nothing else:\n{schema}",
        step = step_index + 1,
        names = names.join(", "),
    )
}

pub fn replan_prompt(
    task: &str,
    team: &str,
    completed: &[Step],
    reason: &str,
    previous_plan: &str,
    schema: &str,
    sentinel_steps: bool,
) -> String {
    let done = if completed.is_empty() {
        "None".to_string()
    } else {
        completed
            .iter()
            .enumerate()
            .map(|(i, s)| format!("COMPLETED STEP {}: {}\n{}", i + 1, s.title(), s.details()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let sentinel = if sentinel_steps { SENTINEL_STEP_GUIDE } else { "" };
    format!(
        "The plan for the task below is not working and needs to change.\n\n\
         Task:\n{task}\n\n\
         Our team:\n{team}\n\n\
         Previous plan:\n{previous_plan}\n\n\
         Steps already completed (they stay as they are):\n{done}\n\n\
         Why the plan failed:\n{reason}\n\n\
         Write only the steps that still need to be done after the completed ones. If nothing \
         else is needed, return an empty \"steps\" list. {sentinel}\n\n\
         Reply with a JSON object matching this schema and nothing else:\n{schema}"
    )
}

/// 普通步骤发给代理的指令
pub fn step_instruction(index: usize, step: &Step, agent: &str, instruction: &str) -> String {
    format!(
        "Step {}: {}\n\n{}\n\nInstruction for {}: {}",
        index + 1,
        step.title(),
        step.details(),
        agent,
        instruction
    )
}

/// 哨兵步骤每次迭代发给代理的指令
pub fn sentinel_instruction(step: &SentinelStep, instruction: &str, progress: &str) -> String {
    let mut out = format!(
        "Your high level goal: {}\nThe following might be useful but rely on the high level goal more: {}",
        step.details, instruction
    );
    if !progress.is_empty() {
        out.push_str(&format!("\n\nProgress so far:\n{}", progress));
    }
    out
}

pub fn sentinel_check_prompt(step: &SentinelStep, schema: &str, dynamic_sleep: bool) -> String {
    let sleep = if dynamic_sleep {
        format!(
            "\nAlso suggest in \"sleep_duration\" how many seconds to wait before the next check \
             (the configured interval is {}s) and say why in \"sleep_duration_reason\".",
            step.sleep_duration
        )
    } else {
        String::new()
    };
    format!(
        "Decide whether this condition is fulfilled right now, based on the agent's last message:\n\
         '{condition}'\n\n\
         The step being monitored:\n{details}\n\n\
         Finding information about the condition is not the same as the condition being met, and \
         pending or future events do not count. When in doubt, answer not met. The only exception \
         is a condition that can never be checked again because the event has already concluded; \
         then treat it as met.\n\
         Set \"error_encountered\" to true if the agent could not meaningfully attempt the check \
         (page did not load, tool failed, access denied).{sleep}\n\n\
         Reply with a JSON object matching this schema and nothing else:\n{schema}",
        condition = step.condition,
        details = step.details,
    )
}

pub fn final_answer_prompt(task: &str, custom: Option<&str>) -> String {
    match custom {
        Some(template) => template.replace("{task}", task),
        None => format!(
            "We have finished working on the task:\n{task}\n\n\
             Using the conversation and the progress summary above, write the final answer for \
             the user. Answer the request directly and completely, without mentioning the plan \
             or the team."
        ),
    }
}

pub fn render_plan_message(summary: &str, plan: &Plan) -> String {
    if summary.is_empty() {
        plan.render()
    } else {
        format!("{}\n\n{}", summary, plan.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SentinelCondition;

    #[test]
    fn test_final_answer_marker() {
        let wrapped = wrap_final_answer("  4 ");
        assert_eq!(wrapped, "Final Answer: 4");
        assert_eq!(extract_final_answer(&wrapped), Some("4"));
        assert_eq!(extract_final_answer("no marker"), None);
    }

    #[test]
    fn test_custom_final_prompt() {
        assert_eq!(
            final_answer_prompt("sum it", Some("Answer '{task}' in one word")),
            "Answer 'sum it' in one word"
        );
    }

    #[test]
    fn test_sentinel_instruction_includes_goal() {
        let step = SentinelStep {
            title: "watch".into(),
            details: "watch the repo stars".into(),
            agent_name: "web_surfer".into(),
            condition: SentinelCondition::Count(2),
            sleep_duration: 1,
        };
        let text = sentinel_instruction(&step, "open github", "");
        assert!(text.starts_with("Your high level goal: watch the repo stars"));
        assert!(text.contains("open github"));
    }
}
