//! `VIIPER_*` environment parsing. Environment access is process-global, so
//! these tests serialize on one lock and restore prior values on drop.

use std::time::Duration;

use tokio::sync::Mutex;
use viiper_server::ServerConfig;

static ENV_LOCK: Mutex<()> = Mutex::const_new(());

struct EnvVarGuard {
    key: &'static str,
    prior: Option<String>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &str) -> Self {
        let prior = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, prior }
    }

    fn unset(key: &'static str) -> Self {
        let prior = std::env::var(key).ok();
        std::env::remove_var(key);
        Self { key, prior }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match self.prior.take() {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
    }
}

const ALL_VARS: [&str; 8] = [
    "VIIPER_USBIP_LISTEN_ADDR",
    "VIIPER_CONTROL_LISTEN_ADDR",
    "VIIPER_PASSWORD",
    "VIIPER_REQUIRE_LOCALHOST_AUTH",
    "VIIPER_CONNECTION_TIMEOUT_MS",
    "VIIPER_DEVICE_HANDLER_CONNECT_TIMEOUT_MS",
    "VIIPER_BUS_CLEANUP_TIMEOUT_MS",
    "VIIPER_WRITE_BATCH_FLUSH_INTERVAL_US",
];

fn clear_all() -> Vec<EnvVarGuard> {
    ALL_VARS.iter().map(|var| EnvVarGuard::unset(var)).collect()
}

#[tokio::test]
async fn defaults_apply_with_an_empty_environment() {
    let _lock = ENV_LOCK.lock().await;
    let _guards = clear_all();

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.usbip_listen_addr.port(), 3241);
    assert_eq!(config.control_listen_addr.port(), 3242);
    assert_eq!(config.password, None);
    assert!(!config.require_localhost_auth);
    assert_eq!(config.write_batch_flush_interval, Duration::from_millis(1));
}

#[tokio::test]
async fn variables_override_every_field() {
    let _lock = ENV_LOCK.lock().await;
    let _guards = clear_all();
    let _addr = EnvVarGuard::set("VIIPER_USBIP_LISTEN_ADDR", "127.0.0.1:13241");
    let _control = EnvVarGuard::set("VIIPER_CONTROL_LISTEN_ADDR", "127.0.0.1:13242");
    let _password = EnvVarGuard::set("VIIPER_PASSWORD", "hunter2");
    let _require = EnvVarGuard::set("VIIPER_REQUIRE_LOCALHOST_AUTH", "true");
    let _conn = EnvVarGuard::set("VIIPER_CONNECTION_TIMEOUT_MS", "2500");
    let _idle = EnvVarGuard::set("VIIPER_DEVICE_HANDLER_CONNECT_TIMEOUT_MS", "750");
    let _cleanup = EnvVarGuard::set("VIIPER_BUS_CLEANUP_TIMEOUT_MS", "1500");
    let _flush = EnvVarGuard::set("VIIPER_WRITE_BATCH_FLUSH_INTERVAL_US", "0");

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.usbip_listen_addr.port(), 13241);
    assert_eq!(config.control_listen_addr.port(), 13242);
    assert_eq!(config.password.as_deref(), Some("hunter2"));
    assert!(config.require_localhost_auth);
    assert_eq!(config.connection_timeout, Duration::from_millis(2500));
    assert_eq!(
        config.device_handler_connect_timeout,
        Duration::from_millis(750)
    );
    assert_eq!(config.bus_cleanup_timeout, Duration::from_millis(1500));
    assert!(config.write_batch_flush_interval.is_zero());
}

#[tokio::test]
async fn empty_password_means_no_auth() {
    let _lock = ENV_LOCK.lock().await;
    let _guards = clear_all();
    let _password = EnvVarGuard::set("VIIPER_PASSWORD", "");

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.password, None);
}

#[tokio::test]
async fn invalid_values_are_reported_with_their_variable() {
    let _lock = ENV_LOCK.lock().await;
    let _guards = clear_all();
    let _addr = EnvVarGuard::set("VIIPER_USBIP_LISTEN_ADDR", "not-an-addr");

    let err = ServerConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("VIIPER_USBIP_LISTEN_ADDR"));
}
