//! Build pipeline scenarios against the in-memory cloud.

mod bdd_steps;
mod scenarios;
mod test_helpers;
