use fail::FailScenario;

/// Fail point configuration scoped to one test.
///
/// Holding the scenario serializes fail point tests within the process. Every configured fail
/// point is switched off again when the scenario is dropped.
pub struct FailPointScenario<'a> {
    _scenario: FailScenario<'a>,
    configured: Vec<String>,
}

impl<'a> FailPointScenario<'a> {
    pub fn setup(failpoints: &[(&str, &str)]) -> FailPointScenario<'a> {
        let mut scenario = Self {
            _scenario: FailScenario::setup(),
            configured: Vec::new(),
        };

        for (name, action) in failpoints {
            scenario.set(name, action);
        }

        scenario
    }

    /// Changes the action of `name`, e.g. to `"off"` once a failure was observed.
    pub fn set(&mut self, name: &str, action: &str) {
        fail::cfg(name, action).unwrap();

        if !self.configured.iter().any(|configured| configured == name) {
            self.configured.push(name.to_string());
        }
    }

    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for FailPointScenario<'_> {
    fn drop(&mut self) {
        for name in &self.configured {
            fail::remove(name);
        }
    }
}
