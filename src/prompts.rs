use crate::config::SandboxBackend;

pub const RETROSPECTIVE_SYSTEM: &str = "As an AI agent, analyze what has been done so far.";

pub const NEXT_TASK_SYSTEM: &str = "You are an assistant that names exactly one next task \
needed to complete the mission. Consider the progress so far and the result of the previous \
task. Leave out code and anything unnecessary, skip optional work, and answer in a single \
sentence.";

/// Placeholder history entry used in place of the first code message once
/// more than one message exists.
pub const FIRST_STEP_PLACEHOLDER: &str = "make the first code to do";

const SHELL_PROMPT_LINE: &str = "$ node code.js";

struct ToolHelp {
    name: &'static str,
    summary: &'static str,
    instruction: &'static str,
}

const COMMON_TOOLS: &[ToolHelp] = &[
    ToolHelp {
        name: "read_file",
        summary: "Reads the contents of a file.",
        instruction: "Provide the path of the file.",
    },
    ToolHelp {
        name: "list_directory",
        summary: "Lists the files and folders of a directory.",
        instruction: "Provide the path of the directory.",
    },
    ToolHelp {
        name: "read_url",
        summary: "Reads the contents of a URL.",
        instruction: "Provide the URL.",
    },
    ToolHelp {
        name: "rename_file_or_directory",
        summary: "Renames a file or directory.",
        instruction: "Provide the current path and the new path.",
    },
    ToolHelp {
        name: "remove_file",
        summary: "Deletes a file.",
        instruction: "Provide the path of the file to delete.",
    },
    ToolHelp {
        name: "remove_directory_recursively",
        summary: "Deletes a directory recursively.",
        instruction: "Provide the path of the directory to delete.",
    },
];

const APT_TOOL: ToolHelp = ToolHelp {
    name: "apt_install",
    summary: "Installs an apt package.",
    instruction: "Provide the name of the package to install.",
};

const SHELL_TOOLS: &[ToolHelp] = &[
    ToolHelp {
        name: "which_command",
        summary: "Checks whether a shell command exists.",
        instruction: "Provide the shell command to look up with which.",
    },
    ToolHelp {
        name: "run_command",
        summary: "Runs a shell command.",
        instruction: "Provide the shell command to run.",
    },
];

/// System prompt for the action request of one iteration. Prompt fragments
/// of external tools are appended after the built-in catalog.
pub fn action_system_prompt(
    mission: &str,
    task: &str,
    backend: SandboxBackend,
    external_prompts: &[&str],
) -> String {
    let mut lines = vec![
        "As a computer task execution agent, perform the work needed for the SUB MISSION \
         that moves the MAIN MISSION forward."
            .to_owned(),
        String::new(),
        format!("- MAIN MISSION: \"{mission}\""),
        format!("- SUB MISSION: \"{task}\""),
        String::new(),
        "## INSTRUCTION".to_owned(),
        "- The tools below are available. Choose the one that best fits the task.".to_owned(),
        String::new(),
        "## Tools".to_owned(),
    ];

    let mut tools = COMMON_TOOLS.iter().collect::<Vec<_>>();
    if backend == SandboxBackend::Container {
        tools.push(&APT_TOOL);
    }
    tools.extend(SHELL_TOOLS.iter());
    for tool in tools {
        lines.push(format!("   ### {}", tool.name));
        lines.push(format!("   - {}", tool.summary));
        lines.push("      #### INSTRUCTION".to_owned());
        lines.push(format!("      - {}", tool.instruction));
        lines.push("   ".to_owned());
    }

    lines.push("   ".to_owned());
    lines.push(external_prompts.join("\n\t\n"));
    lines.join("\n")
}

pub fn evaluation_system_prompt(mission: &str) -> String {
    [
        "As a computer task execution agent, verify strictly and logically whether the MISSION \
         has been fully completed.",
        "If there is already enough OUTPUT to verify it and the mission is done, answer \
         ENDOFMISSION; otherwise answer NOTSOLVED.",
        "If the mission cannot be solved, answer GIVEUPTHEMISSION.",
        "",
        format!("- MISSION: \"{mission}\"").as_str(),
        "",
    ]
    .join("\n")
}

/// History message for one recorded script.
pub fn code_message(code: &str) -> String {
    ["Code to execute", "```javascript", code, "```"].join("\n")
}

/// History message for one recorded execution output, already truncated.
pub fn output_message(output: Option<&str>) -> String {
    match output.filter(|text| !text.is_empty()) {
        Some(text) => [
            "Output of the Execution",
            "```shell",
            SHELL_PROMPT_LINE,
            text,
            "```",
        ]
        .join("\n"),
        None => [
            "No output. The execution completed without any output.",
            "```shell",
            SHELL_PROMPT_LINE,
            "$",
            "```",
        ]
        .join("\n"),
    }
}

/// Block describing the most recent execution. `None` means nothing has run
/// yet and yields no lines.
fn last_output_lines(last: Option<&str>) -> Vec<String> {
    let Some(output) = last else {
        return Vec::new();
    };
    let lines: [&str; 5] = if output.is_empty() {
        [
            "Process ends without any outputs.",
            "```shell",
            SHELL_PROMPT_LINE,
            "$",
            "```",
        ]
    } else {
        ["Output of the Execution", "```shell", SHELL_PROMPT_LINE, output, "```"]
    };
    lines.iter().map(|line| (*line).to_owned()).collect()
}

pub fn retrospective_request(mission: &str, last: Option<&str>) -> String {
    let mut lines = last_output_lines(last);
    lines.extend(
        [
            "",
            format!("MISSION: \"{mission}\"").as_str(),
            "",
            "As an AI agent, summarize the work done so far.",
            "",
            "Guidelines:",
            "- Keep only the essentials, briefly.",
            "- Use plain, direct wording.",
            "- Do not include code.",
        ]
        .map(str::to_owned),
    );
    lines.join("\n")
}

pub fn next_task_request(mission: &str, last: Option<&str>) -> String {
    let mut lines = vec![
        "Tell me the **one and only** task to perform right after this.".to_owned(),
        String::new(),
        String::new(),
    ];
    lines.extend(last_output_lines(last));
    lines.extend(
        [
            "",
            format!("MISSION: \"{mission}\"").as_str(),
            "",
            "INSTRUCTION:",
            "- Considering the mission and the progress so far, give only the single next task.",
            "- Decide what to do logically.",
            "- Skip optional work.",
            "- Do not include code.",
            "- Answer with one sentence.",
            "",
            "OUTPUT",
            "I will ...",
        ]
        .map(str::to_owned),
    );
    lines.join("\n")
}

pub fn action_request(
    last: Option<&str>,
    evaluation: &str,
    done_so_far: &str,
    task: &str,
) -> String {
    let mut lines = vec![String::new()];
    lines.extend(last_output_lines(last));
    lines.extend([
        String::new(),
        "EVALUATION OF THE PREVIOUS TASKS:".to_owned(),
        evaluation.to_owned(),
        String::new(),
        "DID SO FAR:".to_owned(),
        done_so_far.to_owned(),
        String::new(),
        "TASK TO DO NEXT STEP:".to_owned(),
        task.lines().collect::<Vec<_>>().join(" "),
        String::new(),
        "To do this, choose proper action.".to_owned(),
    ]);
    lines.join("\n")
}

pub fn evaluation_request(mission: &str, last: Option<&str>) -> String {
    let mut lines = last_output_lines(last);
    lines.extend(
        [
            "",
            "Does the progress so far and current output indicate mission completion?",
            "Judge what to do to complete the mission by the Output of the Execution and the \
             history we did so far",
            "",
            format!("MISSION: \"{mission}\"").as_str(),
            "",
        ]
        .map(str::to_owned),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_tool_is_only_listed_for_containers() {
        let container = action_system_prompt("m", "t", SandboxBackend::Container, &[]);
        let embedded = action_system_prompt("m", "t", SandboxBackend::Embedded, &[]);
        assert!(container.contains("### apt_install"));
        assert!(!embedded.contains("### apt_install"));
        assert!(embedded.contains("### run_command"));
    }

    #[test]
    fn external_prompts_are_appended() {
        let prompt = action_system_prompt(
            "m",
            "t",
            SandboxBackend::Embedded,
            &["### resize_image", "### ocr"],
        );
        assert!(prompt.ends_with("### resize_image\n\t\n### ocr"));
    }

    #[test]
    fn empty_output_renders_placeholder() {
        let rendered = output_message(Some(""));
        assert!(rendered.starts_with("No output."));
        assert_eq!(output_message(None), rendered);
        assert!(output_message(Some("X")).contains("\nX\n"));
    }

    #[test]
    fn first_request_has_no_output_block() {
        let request = next_task_request("count files", None);
        assert!(!request.contains("```shell"));
        let after_silent_run = next_task_request("count files", Some(""));
        assert!(after_silent_run.contains("Process ends without any outputs."));
    }

    #[test]
    fn action_request_flattens_multiline_task() {
        let request = action_request(Some("ok"), "looks fine", "listed files", "read\nthe file");
        assert!(request.contains("TASK TO DO NEXT STEP:\nread the file\n"));
        assert!(request.contains("EVALUATION OF THE PREVIOUS TASKS:\nlooks fine"));
    }
}
