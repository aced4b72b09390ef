//! The end of a pipeline.

use tracing::debug;

use crate::{
    change::{Change, SourceChange},
    data::Node,
    operator::{FetchRequest, Operator, OperatorError},
};

/// Collects what a pipeline outputs.
///
/// Fetches are read into memory. Changes pushed through the pipeline are
/// recorded until [`Catch::take_pushes`].
#[derive(Debug)]
pub struct Catch {
    input: Box<dyn Operator>,
    pushes: Vec<Change>,
}

impl Catch {
    /// Catches the output of `input`.
    pub fn new(input: impl Operator + 'static) -> Self {
        Self {
            input: Box::new(input),
            pushes: Vec::new(),
        }
    }

    /// Fetches from the pipeline.
    pub fn fetch(&mut self, req: FetchRequest) -> Result<Vec<Node>, OperatorError> {
        Ok(self.input.fetch(req)?.collect())
    }

    /// Like [`Catch::fetch`], also releasing the state kept for `req`.
    pub fn cleanup(&mut self, req: FetchRequest) -> Result<Vec<Node>, OperatorError> {
        Ok(self.input.cleanup(req)?.collect())
    }

    /// Pushes `change` into the pipeline and records its output.
    pub fn push(&mut self, change: SourceChange) -> Result<(), OperatorError> {
        let changes = self.input.push(change)?;
        debug!(changes = changes.len(), "caught pushes");
        self.pushes.extend(changes);
        Ok(())
    }

    /// The changes recorded so far.
    pub fn pushes(&self) -> &[Change] {
        &self.pushes
    }

    /// Returns and clears the recorded changes.
    pub fn take_pushes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.pushes)
    }
}
