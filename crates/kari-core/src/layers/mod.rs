pub mod lstm;
pub mod shared;

pub use lstm::{BiLstm, LstmCell};
pub use shared::{DENSE_UNITS, LSTM_UNITS, SharedLayers};
