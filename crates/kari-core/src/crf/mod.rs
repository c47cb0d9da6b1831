//! Linear-chain CRF output layer and Viterbi decoding.

pub mod model;
pub mod viterbi;

pub use model::CrfLayer;
pub use viterbi::ViterbiDecoder;
