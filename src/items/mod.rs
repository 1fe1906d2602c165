//! Items: raw candidates, canonical keys, and admission rules.

pub mod key;
pub mod model;
pub mod validate;

pub use key::compute_key;
pub use model::{Item, ItemKey, RawItem};
pub use validate::Validator;
