use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TaskParseError;
use crate::models::{
    GenerationSample, GenerationSamplesForDatapoint, PromptInput, RoundTripBranch,
};

/// A round-trip correctness task.
///
/// A task slices a datapoint into a forward generation request, derives
/// one backward request per forward sample, and assembles the
/// per-datapoint record. Implementations are pure: no I/O happens here,
/// all endpoint traffic goes through the engine and its prompt factories.
pub trait RtcTask: Send + Sync + 'static {
    type Datapoint: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Builds the forward prompt input for a datapoint.
    fn to_forward_input(&self, datapoint: &Self::Datapoint) -> PromptInput;

    /// Builds the backward prompt input from one forward completion.
    ///
    /// A completion that does not match the task's structural contract is
    /// a `TaskParseError`, which the engine records as an empty branch.
    fn to_backward_input(
        &self,
        datapoint: &Self::Datapoint,
        forward_sample: &GenerationSample,
    ) -> Result<PromptInput, TaskParseError>;

    /// Assembles the persisted record. Branch order must match forward
    /// request-issue order.
    fn assemble_record(
        &self,
        datapoint: Self::Datapoint,
        branches: Vec<RoundTripBranch>,
    ) -> GenerationSamplesForDatapoint<Self::Datapoint> {
        GenerationSamplesForDatapoint { datapoint, branches }
    }

    /// Renders one record as an HTML fragment for the visualization.
    fn samples_to_html(&self, record: &GenerationSamplesForDatapoint<Self::Datapoint>) -> String;
}
