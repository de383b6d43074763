//! Behavioural scenarios for `kiln build`.

mod build;
