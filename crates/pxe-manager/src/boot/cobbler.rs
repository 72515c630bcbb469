//! Cobbler XML-RPC client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::xmlrpc::{self, Value};
use super::{BootError, NetworkBootController, SystemRecord};
use crate::config::CobblerConfig;

/// What Cobbler returns from `get_system` for an unknown name.
const MISSING_SYSTEM: &str = "~";

/// Cobbler network-boot controller.
pub struct Cobbler {
    /// HTTP client.
    client: Client,
    /// XML-RPC endpoint.
    url: String,
    /// Login user.
    username: String,
    /// Login password.
    password: String,
    /// Session token, fetched on first use.
    token: Mutex<Option<String>>,
}

impl Cobbler {
    /// Create a new Cobbler client. Login is deferred to the first call.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(config: &CobblerConfig) -> Result<Self, BootError> {
        if config.url.is_empty() {
            return Err(BootError::Config("cobbler.url is empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            token: Mutex::new(None),
        })
    }

    /// Make an unauthenticated XML-RPC call.
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, BootError> {
        debug!(url = %self.url, method = %method, "XML-RPC call");

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(xmlrpc::encode_call(method, params))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BootError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        xmlrpc::decode_response(&text)
    }

    /// Log in and return a fresh session token.
    async fn login(&self) -> Result<String, BootError> {
        info!(url = %self.url, user = %self.username, "Logging in to Cobbler");
        let token = self
            .call(
                "login",
                &[
                    Value::from(self.username.as_str()),
                    Value::from(self.password.as_str()),
                ],
            )
            .await?;
        token
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BootError::Protocol(format!("login returned {token:?}")))
    }

    /// Current session token, logging in if there is none.
    async fn token(&self) -> Result<String, BootError> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }
        let fresh = self.login().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    /// Make a call with the session token appended, logging in again once
    /// if the token has expired.
    async fn call_authed(&self, method: &str, params: &[Value]) -> Result<Value, BootError> {
        let mut args = params.to_vec();
        args.push(Value::from(self.token().await?));

        match self.call(method, &args).await {
            Err(BootError::Fault { message, .. }) if is_token_fault(&message) => {
                warn!(method = %method, "Cobbler session expired, logging in again");
                *self.token.lock().await = None;
                args.pop();
                args.push(Value::from(self.token().await?));
                self.call(method, &args).await
            }
            other => other,
        }
    }

    /// Modify one field of a system and save it.
    async fn modify_and_save(
        &self,
        hostname: &str,
        field: &str,
        value: Value,
    ) -> Result<(), BootError> {
        let handle = self.find_system(hostname).await?;
        debug!(hostname = %hostname, field = %field, "Modifying system");

        let modified = self
            .call_authed("modify_system", &[Value::from(handle.as_str()), field.into(), value])
            .await?;
        if !modified.is_truthy() {
            return Err(BootError::Protocol(format!(
                "modify_system {field} on {hostname} returned {modified:?}"
            )));
        }

        self.call_authed("save_system", &[Value::from(handle)]).await?;
        Ok(())
    }
}

fn is_token_fault(message: &str) -> bool {
    message.contains("invalid token") || message.contains("token expired")
}

fn system_not_found(hostname: &str, message: &str) -> Option<BootError> {
    message
        .contains("unknown system name")
        .then(|| BootError::SystemNotFound(hostname.to_string()))
}

#[async_trait]
impl NetworkBootController for Cobbler {
    async fn find_system(&self, hostname: &str) -> Result<String, BootError> {
        match self
            .call_authed("get_system_handle", &[Value::from(hostname)])
            .await
        {
            Ok(handle) => handle.as_str().map(str::to_string).ok_or_else(|| {
                BootError::Protocol(format!("get_system_handle returned {handle:?}"))
            }),
            Err(BootError::Fault { code, message }) => {
                Err(system_not_found(hostname, &message)
                    .unwrap_or(BootError::Fault { code, message }))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_system(&self, hostname: &str) -> Result<SystemRecord, BootError> {
        let system = self.call("get_system", &[Value::from(hostname)]).await?;
        if system.as_str() == Some(MISSING_SYSTEM) {
            return Err(BootError::SystemNotFound(hostname.to_string()));
        }

        let addresses = match system.get("interfaces") {
            Some(Value::Struct(interfaces)) => interfaces
                .values()
                .filter_map(|iface| iface.get("ip_address").and_then(Value::as_str))
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(SystemRecord {
            name: system
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(hostname)
                .to_string(),
            profile: system
                .get("profile")
                .and_then(Value::as_str)
                .map(str::to_string),
            addresses,
        })
    }

    async fn assign_profile(&self, hostname: &str, profile: &str) -> Result<(), BootError> {
        self.modify_and_save(hostname, "profile", Value::from(profile))
            .await
    }

    async fn set_netboot_enabled(&self, hostname: &str, enabled: bool) -> Result<(), BootError> {
        self.modify_and_save(hostname, "netboot-enabled", Value::Int(i64::from(enabled)))
            .await
    }

    async fn power_cycle(&self, hostnames: &[String]) -> Result<(), BootError> {
        info!(systems = ?hostnames, "Power cycling");

        let mut args = BTreeMap::new();
        args.insert("power".to_string(), Value::from("reboot"));
        args.insert(
            "systems".to_string(),
            Value::Array(hostnames.iter().map(|h| Value::from(h.as_str())).collect()),
        );

        let task = self
            .call_authed("background_power_system", &[Value::Struct(args)])
            .await?;
        debug!(task = ?task, "Power task queued");
        Ok(())
    }
}
