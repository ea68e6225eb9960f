#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregate;
pub mod combination;
pub mod data;
pub mod engine;
pub mod gam;
pub mod learner;
pub mod terms;

pub use combination::GroupSpec;
pub use data::Dataset;
pub use engine::{CollabError, CollabExplainer, Decomposition};
