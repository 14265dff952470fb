//! Model loading: the GGUF container reader and the immutable model store.

pub mod gguf;
pub mod store;

pub use store::{Hyperparams, LayerWeights, Model};
