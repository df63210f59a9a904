use serde::{Deserialize, Serialize};

/// Fixture kinds a runner can attach to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureType {
    ClassSetup,
    Setup,
    Teardown,
    ClassTeardown,
    SetupTeardown,
    ClassSetupTeardown,
}

impl FixtureType {
    /// Class-level teardown fixtures report failures after their method
    /// name has already left the outstanding set. Results for these are
    /// accepted without shrinking the set.
    pub fn can_return_unexpected_results(&self) -> bool {
        matches!(
            self,
            FixtureType::ClassTeardown | FixtureType::ClassSetupTeardown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub module: String,
    pub class: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub fixture_type: Option<FixtureType>,
}

/// One result posted by a runner. Only `method` and `success` drive the
/// scheduler; the rest is carried through to reporters untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResult {
    pub method: MethodInfo,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_run: Option<Box<MethodResult>>,

    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub run_time: Option<f64>,
    #[serde(default)]
    pub normalized_run_time: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub failure: Option<bool>,
    #[serde(default)]
    pub error: Option<bool>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub exception_info: Option<String>,
    #[serde(default)]
    pub exception_info_pretty: Option<String>,
    #[serde(default)]
    pub exception_only: Option<String>,
    #[serde(default)]
    pub runner_id: Option<String>,
}

impl MethodResult {
    /// Canonical `"<module> <Class>"` key the result belongs to.
    pub fn class_path(&self) -> String {
        format!("{} {}", self.method.module, self.method.class)
    }
}
