pub mod recommendation;
pub mod training;
