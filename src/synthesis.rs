use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::error::TaskParseError;
use crate::models::{
    FewShotExample, GenerationSample, GenerationSamplesForDatapoint, PromptInput,
};
use crate::output::escape_html;
use crate::task::RtcTask;

/// Default instruction for the code -> description direction.
pub const DEFAULT_FORWARD_INSTRUCTION: &str = "Describe briefly and concisely with imperative \
natural language the code region delimited by the region markers in the code excerpt below. End \
the description with the region end marker.";

/// Default instruction for the description -> code direction.
pub const DEFAULT_BACKWARD_INSTRUCTION: &str =
    "Synthesize the snippet of code that resolves the TODO(LLM) comment.";

/// A code span <-> natural language description datapoint.
///
/// The hole is the code region being described and regenerated;
/// `code_before_hole` and `code_after_hole` give the surrounding context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRtcExample {
    pub filename: String,
    /// (row, column) of the hole start in the source file.
    #[serde(default)]
    pub start_point: (u32, u32),
    #[serde(default)]
    pub end_point: (u32, u32),
    /// Code before the hole; when non-empty it must end with a newline.
    pub code_before_hole: String,
    /// Code after the hole.
    pub code_after_hole: String,
    /// The code in the hole; non-blank and newline-terminated.
    pub code_in_hole: String,
    /// Line-comment prefix of the file's language, e.g. `//` or `#`.
    pub line_comment_prefix: String,
    #[serde(default)]
    pub ground_truth_description: Option<String>,
}

impl SynthesisRtcExample {
    /// Checks the invariants the prompt renderers rely on.
    pub fn validate(&self) -> Result<()> {
        if !self.code_before_hole.is_empty() && !self.code_before_hole.ends_with('\n') {
            bail!("`code_before_hole` must end with a newline");
        }
        if self.code_in_hole.trim().is_empty() {
            bail!("`code_in_hole` must not be blank");
        }
        if !self.code_in_hole.ends_with('\n') {
            bail!("`code_in_hole` must end with a newline");
        }
        Ok(())
    }

    /// Leading whitespace of the hole, reused when inserting comments.
    pub fn indentation(&self) -> &str {
        let trimmed = self.code_in_hole.trim_start();
        &self.code_in_hole[..self.code_in_hole.len() - trimmed.len()]
    }

    /// The full file content with the hole delimited by marker comments.
    pub fn code_with_annotated_region(&self, start_marker: &str, end_marker: &str) -> String {
        let indentation = self.indentation();
        format!(
            "{}{indentation}{prefix}{start_marker}\n{}{indentation}{prefix}{end_marker}\n{}",
            self.code_before_hole,
            self.code_in_hole,
            self.code_after_hole,
            prefix = self.line_comment_prefix,
        )
    }

    /// The full file content with the hole replaced by a TODO comment
    /// carrying the description.
    pub fn code_with_todo_at_hole(&self, description: &str) -> String {
        let mut comment = String::new();
        for line in format!("TODO(LLM): {description}").lines() {
            comment.push_str(self.indentation());
            comment.push_str(&self.line_comment_prefix);
            comment.push(' ');
            comment.push_str(line);
            comment.push('\n');
        }
        format!("{}{comment}{}", self.code_before_hole, self.code_after_hole)
    }
}

/// Strips the longest common leading whitespace from all non-blank lines.
fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.len() >= margin {
            out.push_str(&line[margin..]);
        }
        out.push('\n');
    }
    if !text.ends_with('\n') {
        out.pop();
    }
    out
}

/// The code region <-> description round-trip task.
///
/// Forward: annotate the hole with region markers and ask for a
/// description that ends with the region end marker. Backward: replace the
/// hole with a TODO comment carrying that description and ask for the
/// code.
pub struct SynthesisRtc {
    forward_instruction: String,
    backward_instruction: String,
    region_start_marker: String,
    region_end_marker: String,
    example_separator: String,
    stop_tokens: Vec<String>,
    forward_few_shot: Vec<FewShotExample>,
    backward_few_shot: Vec<FewShotExample>,
}

impl SynthesisRtc {
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
            region_start_marker: config.region_start_marker.clone(),
            region_end_marker: config.region_end_marker.clone(),
            example_separator: config.example_separator.clone(),
            stop_tokens: config.stop_tokens(),
            forward_few_shot: Vec::new(),
            backward_few_shot: Vec::new(),
        };
        for example in &config.synthesis_few_shot {
            example.validate()?;
            let Some(description) = &example.ground_truth_description else {
                bail!(
                    "few-shot example `{}` needs a ground_truth_description",
                    example.filename
                );
            };
            let forward_input = task.forward_content(example);
            let backward_input = task.backward_content(example, description);
            task.forward_few_shot.push(FewShotExample {
                input: forward_input,
                output: format!("{description} {}", task.region_end_marker),
            });
            task.backward_few_shot.push(FewShotExample {
                input: backward_input,
                output: dedent(&example.code_in_hole),
            });
        }
        Ok(task)
    }

    fn forward_content(&self, datapoint: &SynthesisRtcExample) -> String {
        format!(
            "{}\nDescription: ",
            datapoint.code_with_annotated_region(&self.region_start_marker, &self.region_end_marker)
        )
    }

    fn backward_content(&self, datapoint: &SynthesisRtcExample, description: &str) -> String {
        format!("{}\nCode:\n", datapoint.code_with_todo_at_hole(description))
    }

    /// Extracts the description from a raw forward completion.
    ///
    /// The completion is truncated at the example separator, then must
    /// contain the region end marker; a leading region start marker is
    /// tolerated and stripped.
    fn parse_description(&self, raw: &str) -> Result<String, TaskParseError> {
        let text = match raw.find(&self.example_separator) {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let Some(end) = text.find(&self.region_end_marker) else {
            return Err(TaskParseError(format!(
                "forward sample is missing the region end marker `{}`",
                self.region_end_marker
            )));
        };
        let mut description = &text[..end];
        if let Some(start) = description.find(&self.region_start_marker) {
            description = &description[start + self.region_start_marker.len()..];
        }
        let description = description.trim();
        if description.is_empty() {
            return Err(TaskParseError(
                "forward sample has an empty description".to_string(),
            ));
        }
        Ok(description.to_string())
    }
}

impl RtcTask for SynthesisRtc {
    type Datapoint = SynthesisRtcExample;

    fn to_forward_input(&self, datapoint: &Self::Datapoint) -> PromptInput {
        PromptInput {
            instruction: self.forward_instruction.clone(),
            few_shot: self.forward_few_shot.clone(),
            content: self.forward_content(datapoint),
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
            content: self.backward_content(datapoint, &description),
            stop_tokens: self.stop_tokens.clone(),
        })
    }

    fn samples_to_html(&self, record: &GenerationSamplesForDatapoint<Self::Datapoint>) -> String {
        let datapoint = &record.datapoint;
        let mut html = String::new();
        html.push_str(&format!(
            "<h2>{} ({:?}-{:?})</h2>\n<pre>\n{}<span style=\"color:darkred; font-weight:bold;\">{}</span>{}</pre>\n",
            escape_html(&datapoint.filename),
            datapoint.start_point,
            datapoint.end_point,
            escape_html(&datapoint.code_before_hole),
            escape_html(&datapoint.code_in_hole),
            escape_html(&datapoint.code_after_hole),
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
