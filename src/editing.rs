use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::error::TaskParseError;
use crate::models::{
    FewShotExample, GenerationSample, GenerationSamplesForDatapoint, PromptInput,
};
use crate::output::escape_html;
use crate::task::RtcTask;

/// Default instruction for the edit -> description direction.
pub const DEFAULT_FORWARD_INSTRUCTION: &str = "Describe concisely and accurately with natural \
language the differences between the old and new code shown below.";

/// Default instruction for the description -> edit direction.
pub const DEFAULT_BACKWARD_INSTRUCTION: &str = "Write new code which applies the change \
described in the edit description to the old code.";

/// A code edit <-> natural language description datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingRtcExample {
    pub filename: String,
    pub code_before_edit: String,
    pub code_after_edit: String,
    #[serde(default)]
    pub ground_truth_edit_description: Option<String>,
}

impl EditingRtcExample {
    pub fn validate(&self) -> Result<()> {
        if self.code_before_edit == self.code_after_edit {
            bail!("`code_before_edit` and `code_after_edit` must differ");
        }
        Ok(())
    }
}

/// The code edit <-> description round-trip task.
///
/// Forward: show the old and new code, ask for an edit description.
/// Backward: show the old code and the description, ask for the new code.
pub struct EditingRtc {
    forward_instruction: String,
    backward_instruction: String,
    example_separator: String,
    stop_tokens: Vec<String>,
    forward_few_shot: Vec<FewShotExample>,
    backward_few_shot: Vec<FewShotExample>,
}

impl EditingRtc {
    pub fn new(config: &TaskConfig) -> Result<Self> {
        let mut task = Self {
            forward_instruction: config
                .forward_instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_FORWARD_INSTRUCTION.to_string()),
            backward_instruction: config
                .backward_instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKWARD_INSTRUCTION.to_string()),
            example_separator: config.example_separator.clone(),
            stop_tokens: config.stop_tokens(),
            forward_few_shot: Vec::new(),
            backward_few_shot: Vec::new(),
        };
        for example in &config.editing_few_shot {
            example.validate()?;
            let Some(description) = &example.ground_truth_edit_description else {
                bail!(
                    "few-shot example `{}` needs a ground_truth_edit_description",
                    example.filename
                );
            };
            task.forward_few_shot.push(FewShotExample {
                input: Self::forward_content(example),
                output: description.clone(),
            });
            task.backward_few_shot.push(FewShotExample {
                input: Self::backward_content(example, description),
                output: example.code_after_edit.clone(),
            });
        }
        Ok(task)
    }

    fn forward_content(datapoint: &EditingRtcExample) -> String {
        format!(
            "[old]\n{}\n[new]\n{}\n[edit description] ",
            datapoint.code_before_edit, datapoint.code_after_edit
        )
    }

    fn backward_content(datapoint: &EditingRtcExample, description: &str) -> String {
        format!(
            "[old]\n{}\n[edit description] {description}\n[new]\n",
            datapoint.code_before_edit
        )
    }

    /// Extracts the edit description from a raw forward completion.
    fn parse_description(&self, raw: &str) -> Result<String, TaskParseError> {
        let text = match raw.find(&self.example_separator) {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let description = text.trim();
        if description.is_empty() {
            return Err(TaskParseError(
                "forward sample contains no edit description".to_string(),
            ));
        }
        Ok(description.to_string())
    }
}

impl RtcTask for EditingRtc {
    type Datapoint = EditingRtcExample;

    fn to_forward_input(&self, datapoint: &Self::Datapoint) -> PromptInput {
        PromptInput {
            instruction: self.forward_instruction.clone(),
            few_shot: self.forward_few_shot.clone(),
            content: Self::forward_content(datapoint),
            stop_tokens: self.stop_tokens.clone(),
        }
    }

    fn to_backward_input(
        &self,
        datapoint: &Self::Datapoint,
        forward_sample: &GenerationSample,
    ) -> Result<PromptInput, TaskParseError> {
        let description = self.parse_description(&forward_sample.text)?;
        Ok(PromptInput {
            instruction: self.backward_instruction.clone(),
            few_shot: self.backward_few_shot.clone(),
            content: Self::backward_content(datapoint, &description),
            stop_tokens: self.stop_tokens.clone(),
        })
    }

    fn samples_to_html(&self, record: &GenerationSamplesForDatapoint<Self::Datapoint>) -> String {
        let datapoint = &record.datapoint;
        let mut html = String::new();
        html.push_str(&format!(
            "<h2>{}</h2>\n<pre>\n<span style=\"color:darkred; font-weight:bold;\">{}</span>\n<span style=\"color:darkgreen; font-weight:bold;\">{}</span></pre>\n",
            escape_html(&datapoint.filename),
            escape_html(&datapoint.code_before_edit),
            escape_html(&datapoint.code_after_edit),
        ));
        html.push_str("<h4>Forward Samples</h4>\n<ol>");
        for branch in &record.branches {
            html.push_str(&format!(
                "<li>{}</li>\n",
                escape_html(&branch.forward_sample.text)
            ));
        }
        html.push_str("</ol>\n<h4>Backward Samples</h4>\n<table>");
        for (i, branch) in record.branches.iter().enumerate() {
            html.push_str(&format!("<tr><td>{}</td>\n", i + 1));
            for backward in &branch.backward_samples {
                html.push_str(&format!("<td><pre>{}</pre></td>", escape_html(&backward.text)));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</table>\n");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TaskConfig, TaskKind};

    fn example() -> EditingRtcExample {
        EditingRtcExample {
            filename: "server.go".to_string(),
            code_before_edit: "if len(name) < 5 {\n  return errTooShort\n}\n".to_string(),
            code_after_edit: "if name == \"\" {\n  return errEmpty\n}\n".to_string(),
            ground_truth_edit_description: Some(
                "Replace the length check with an emptiness check.".to_string(),
            ),
        }
    }

    fn task_config() -> TaskConfig {
        TaskConfig {
            kind: TaskKind::Editing,
            forward_instruction: None,
            backward_instruction: None,
            region_start_marker: "<<<region start>>>".to_string(),
            region_end_marker: "<<<region end>>>".to_string(),
            example_separator: "\n\n".to_string(),
            stopping_tokens: vec![],
            synthesis_few_shot: vec![],
            editing_few_shot: vec![],
        }
    }

    fn task() -> EditingRtc {
        EditingRtc::new(&task_config()).unwrap()
    }

    fn forward_sample(text: &str) -> GenerationSample {
        GenerationSample {
            text: text.to_string(),
            temperature: 0.8,
            sample_index: 0,
        }
    }

    #[test]
    fn test_validate_rejects_identical_sides() {
        let mut unchanged = example();
        unchanged.code_after_edit = unchanged.code_before_edit.clone();
        assert!(unchanged.validate().is_err());
        example().validate().unwrap();
    }

    #[test]
    fn test_forward_input_frames_old_and_new() {
        let input = task().to_forward_input(&example());
        assert!(input.content.starts_with("[old]\nif len(name) < 5 {"));
        assert!(input.content.contains("\n[new]\nif name == \"\" {"));
        assert!(input.content.ends_with("[edit description] "));
        assert_eq!(input.instruction, DEFAULT_FORWARD_INSTRUCTION);
    }

    #[test]
    fn test_backward_input_carries_the_sampled_description() {
        let input = task()
            .to_backward_input(&example(), &forward_sample("Check for emptiness instead."))
            .unwrap();
        assert!(
            input
                .content
                .contains("[edit description] Check for emptiness instead.\n[new]\n")
        );
        assert!(!input.content.contains("errEmpty"));
    }

    #[test]
    fn test_description_truncates_at_separator() {
        let input = task()
            .to_backward_input(
                &example(),
                &forward_sample("Check for emptiness instead.\n\n[old]\nspilled next example"),
            )
            .unwrap();
        assert!(!input.content.contains("spilled next example"));
    }

    #[test]
    fn test_blank_forward_sample_is_a_parse_error() {
        let result = task().to_backward_input(&example(), &forward_sample("  \n"));
        assert!(result.is_err());
    }

    #[test]
    fn test_few_shot_rendering() {
        let mut config = task_config();
        config.editing_few_shot = vec![example()];
        let task = EditingRtc::new(&config).unwrap();
        let input = task.to_forward_input(&example());
        assert_eq!(input.few_shot.len(), 1);
        assert!(input.few_shot[0].input.ends_with("[edit description] "));
        assert_eq!(
            input.few_shot[0].output,
            "Replace the length check with an emptiness check."
        );
        let backward = task
            .to_backward_input(&example(), &forward_sample("Do it."))
            .unwrap();
        assert_eq!(backward.few_shot[0].output, example().code_after_edit);
    }

    #[test]
    fn test_few_shot_without_ground_truth_is_rejected() {
        let mut config = task_config();
        let mut bare = example();
        bare.ground_truth_edit_description = None;
        config.editing_few_shot = vec![bare];
        assert!(EditingRtc::new(&config).is_err());
    }
}
