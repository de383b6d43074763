//! Shared fixtures for build BDD scenarios.

use std::collections::BTreeMap;

use kiln::BuildConfig;
use kiln::test_support::{FakeCloud, FakeCommunicator, sample_config};
use rstest::fixture;

pub const HOME_REGION: &str = "home";

#[derive(Clone, Debug)]
pub enum BuildResult {
    Success {
        images: BTreeMap<String, String>,
        warnings: Vec<String>,
    },
    Failure {
        message: String,
    },
}

#[derive(Clone, Debug)]
pub struct BuildContext {
    pub cloud: FakeCloud,
    pub communicator: FakeCommunicator,
    pub config: BuildConfig,
    pub outcome: Option<BuildResult>,
}

#[fixture]
pub fn build_context() -> BuildContext {
    BuildContext {
        cloud: FakeCloud::new(HOME_REGION),
        communicator: FakeCommunicator::new(),
        config: sample_config(),
        outcome: None,
    }
}
