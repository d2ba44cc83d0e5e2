//! Colour-transfer training on a tiny scalar computation graph.
//!
//! - [`engine`]: shared expression DAG, forward evaluation, forward-mode
//!   derivatives and value-table checkpoints
//! - [`nn`]: fully connected layers and the 3-4-3 colour network
//! - [`train`]: gradient descent, on the caller's thread or a worker thread
//! - [`image`] and [`shader`]: per-pixel inference and GLSL emission
//! - [`inspect`]: DAG export and Graphviz rendering

pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod inspect;
pub mod nn;
pub mod shader;
pub mod train;

pub use config::{Parallelism, TrainerConfig};
pub use engine::{BinaryOp, Checkpoint, Evaluator, Expr, Node, NodeId, UnaryOp};
pub use error::{Error, Result};
pub use image::{Image, Rgb, Sample};
pub use nn::{ColourNetwork, Layer};
pub use shader::ShaderTransform;
pub use train::{Session, StepReport, Trainer, TrainerState, TrainingOutput, TrainingRequest};
