#[macro_use]
pub mod optim;

pub mod bitmap;
pub mod fvec;
pub mod hook;
pub mod md;
pub mod quiesce;
