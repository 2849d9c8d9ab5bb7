//! Scriptable fake of the Phyn cloud API
//!
//! Every outcome can be set per test; calls are recorded for assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use phyn::api::{ApiError, Brand, Home, LeakTestResponse, PhynClient, PhynConnector};

struct FakeState {
    connect_error: Mutex<Option<ApiError>>,
    homes: Mutex<Result<Vec<Home>, ApiError>>,
    leak_test_code: Mutex<Option<String>>,
    connect_calls: AtomicUsize,
    logins: Mutex<Vec<(String, String, Brand)>>,
    leak_tests: Mutex<Vec<(String, bool)>>,
}

pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    /// Accepts any credentials; the account has a single home "Home A"
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState {
                connect_error: Mutex::new(None),
                homes: Mutex::new(Ok(vec![Home::named("Home A")])),
                leak_test_code: Mutex::new(Some("success".to_string())),
                connect_calls: AtomicUsize::new(0),
                logins: Mutex::new(Vec::new()),
                leak_tests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_connect(&self, err: ApiError) {
        *self.state.connect_error.lock().unwrap() = Some(err);
    }

    pub fn reject_credentials(&self) {
        self.fail_connect(ApiError::not_authorized("Incorrect username or password."));
    }

    pub fn accept_credentials(&self) {
        *self.state.connect_error.lock().unwrap() = None;
    }

    pub fn set_homes(&self, homes: Vec<Home>) {
        *self.state.homes.lock().unwrap() = Ok(homes);
    }

    pub fn fail_homes(&self, err: ApiError) {
        *self.state.homes.lock().unwrap() = Err(err);
    }

    pub fn set_leak_test_code(&self, code: Option<&str>) {
        *self.state.leak_test_code.lock().unwrap() = code.map(str::to_string);
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> Vec<(String, String, Brand)> {
        self.state.logins.lock().unwrap().clone()
    }

    pub fn last_login(&self) -> Option<(String, String, Brand)> {
        self.logins().pop()
    }

    pub fn leak_tests(&self) -> Vec<(String, bool)> {
        self.state.leak_tests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhynConnector for FakeConnector {
    async fn connect(
        &self,
        username: &str,
        password: &str,
        brand: Brand,
    ) -> Result<Arc<dyn PhynClient>, ApiError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .logins
            .lock()
            .unwrap()
            .push((username.to_string(), password.to_string(), brand));

        if let Some(err) = self.state.connect_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(Arc::new(FakeClient {
            state: self.state.clone(),
        }))
    }
}

struct FakeClient {
    state: Arc<FakeState>,
}

#[async_trait]
impl PhynClient for FakeClient {
    async fn get_homes(&self, _username: &str) -> Result<Vec<Home>, ApiError> {
        self.state.homes.lock().unwrap().clone()
    }

    async fn run_leak_test(
        &self,
        device_id: &str,
        extended: bool,
    ) -> Result<LeakTestResponse, ApiError> {
        self.state
            .leak_tests
            .lock()
            .unwrap()
            .push((device_id.to_string(), extended));
        Ok(LeakTestResponse {
            code: self.state.leak_test_code.lock().unwrap().clone(),
            ..Default::default()
        })
    }
}
