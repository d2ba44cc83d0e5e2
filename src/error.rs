use thiserror::Error;

/// Errors raised by the graph engine and the training worker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An expression handle without a root was combined or evaluated.
    #[error("expression has no root node")]
    EmptyExpression,

    /// The node is not a variable registered with this evaluator.
    #[error("parameter is not registered")]
    NotRegistered,

    /// The node has no cached value; evaluate an expression reaching it first.
    #[error("node has not been evaluated")]
    NotEvaluated,

    /// A training request carried no colour samples.
    #[error("training needs at least one colour sample")]
    EmptySamples,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("image of {width}x{height} cannot hold {len} pixels")]
    ImageSize {
        width: usize,
        height: usize,
        len: usize,
    },

    #[error("could not spawn training worker: {0}")]
    Spawn(String),

    #[error("training worker panicked")]
    WorkerPanicked,

    /// Raised while exporting a graph; expression graphs are acyclic by construction.
    #[error("edge would create a cycle")]
    WouldCycle,
}

pub type Result<T> = std::result::Result<T, Error>;
