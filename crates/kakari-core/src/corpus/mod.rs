//! Treebank input and output: CoNLL-X files, vocabularies and batching.

pub mod conll;
pub mod dataset;
pub mod vocab;

pub use conll::Corpus;
pub use dataset::{Batch, TextDataset};
pub use vocab::Vocab;
