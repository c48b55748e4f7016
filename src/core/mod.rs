pub mod base;
pub mod data;
pub mod methods;
pub mod topic;
