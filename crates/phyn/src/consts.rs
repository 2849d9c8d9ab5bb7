//! Integration constants

pub const DOMAIN: &str = "phyn";

pub const CONF_USERNAME: &str = "username";
pub const CONF_PASSWORD: &str = "password";
/// Capitalized to match entries written by earlier releases
pub const CONF_BRAND: &str = "Brand";

/// Entry schema version written by the config flow
pub const CONFIG_FLOW_VERSION: u32 = 1;
pub const CONFIG_FLOW_MINOR_VERSION: u32 = 2;

pub const STEP_USER: &str = "user";
pub const STEP_REAUTH: &str = "reauth";
pub const STEP_REAUTH_CONFIRM: &str = "reauth_confirm";
pub const STEP_RECONFIGURE: &str = "reconfigure";

/// Status code the auth backend uses for rejected credentials
pub const NOT_AUTHORIZED_CODE: &str = "NotAuthorizedException";

pub const SERVICE_LEAK_TEST: &str = "leak_test";
pub const ATTR_ENTITY_ID: &str = "entity_id";
pub const ATTR_EXTENDED: &str = "extended";
pub const LEAK_TEST_SUCCESS: &str = "success";
