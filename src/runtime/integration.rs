//! Side-effecting step handlers (HTTP, database, email, webhook, script)
//!
//! The executor never fails toward its caller: every internal error becomes a
//! result map with `isSuccess: false` and an `error` message. Templates in the
//! configuration are bound against the step input with the variable binder
//! before dispatch.

use crate::runtime::{binder, lua};
use crate::workflow::types::{DataMap, StepType};
use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;

/// Header carrying the webhook payload signature unless overridden per step
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Flowrun-Signature";

/// Performs the external work of integration steps
#[async_trait]
pub trait IntegrationExecutor: Send + Sync {
    /// Run one step; the result always carries `isSuccess` (and `error` on failure)
    async fn execute(&self, step_type: &StepType, configuration: &DataMap, input: &DataMap) -> DataMap;

    /// Required configuration keys that are absent, null or empty
    fn missing_configuration(&self, step_type: &StepType, configuration: &DataMap) -> Vec<String> {
        required_configuration(step_type)
            .iter()
            .filter(|key| !has_value(configuration, key))
            .map(|key| key.to_string())
            .collect()
    }

    /// Whether the configuration carries every required key for the step type
    fn validate(&self, step_type: &StepType, configuration: &DataMap) -> bool {
        self.missing_configuration(step_type, configuration).is_empty()
    }
}

/// Configuration keys each integration step type cannot run without
pub fn required_configuration(step_type: &StepType) -> &'static [&'static str] {
    match step_type {
        StepType::HttpRequest => &["url"],
        StepType::DatabaseQuery => &["connectionString", "query"],
        StepType::EmailSend => &["to", "subject"],
        StepType::Webhook => &["url", "secret"],
        StepType::ScriptExecution => &["script"],
        _ => &[],
    }
}

fn has_value(configuration: &DataMap, key: &str) -> bool {
    match configuration.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(_) => true,
    }
}

/// Settings for the built-in executor
#[derive(Debug, Clone)]
pub struct IntegrationSettings {
    /// Timeout applied to every outbound HTTP call
    pub http_timeout: Duration,
    /// Mail relay used by EmailSend steps that do not name one
    pub mail_relay_url: Option<String>,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            mail_relay_url: None,
        }
    }
}

/// Built-in executor backed by reqwest, sqlx (SQLite) and the Lua sandbox
#[derive(Debug)]
pub struct DefaultIntegrationExecutor {
    client: reqwest::Client,
    mail_relay_url: Option<String>,
    /// Pools keyed by connection string
    pools: RwLock<HashMap<String, SqlitePool>>,
}

impl Default for DefaultIntegrationExecutor {
    fn default() -> Self {
        Self::new(IntegrationSettings::default())
    }
}

impl DefaultIntegrationExecutor {
    pub fn new(settings: IntegrationSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("⚠️ Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            mail_relay_url: settings.mail_relay_url,
            pools: RwLock::new(HashMap::new()),
        }
    }

    async fn dispatch(&self, step_type: &StepType, configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
        let missing = self.missing_configuration(step_type, configuration);
        if !missing.is_empty() {
            return Err(anyhow::anyhow!("Missing required configuration: {}", missing.join(", ")));
        }

        match step_type {
            StepType::HttpRequest => self.http_request(configuration, input).await,
            StepType::DatabaseQuery => self.database_query(configuration, input).await,
            StepType::EmailSend => self.send_email(configuration, input).await,
            StepType::Webhook => self.call_webhook(configuration, input).await,
            StepType::ScriptExecution => {
                let (configuration, input) = (configuration.clone(), input.clone());
                tokio::task::spawn_blocking(move || run_script(&configuration, &input))
                    .await
                    .map_err(|e| anyhow::anyhow!("Script task failed: {}", e))?
            }
            other => Err(anyhow::anyhow!("{:?} is not an integration step", other)),
        }
    }

    async fn http_request(&self, configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
        let url = config_str(configuration, "url").unwrap_or_default();
        let url = binder::bind(url, input);
        let method = config_str(configuration, "method").unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| anyhow::anyhow!("Unsupported HTTP method: {}", method))?;

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);
        let mut request = self.client.request(method.clone(), &url);

        if let Some(headers) = configuration.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let value = match value {
                    Value::String(template) => binder::bind(template, input),
                    other => binder::value_to_string(other),
                };
                request = request.header(name.as_str(), value);
            }
        }

        if method == reqwest::Method::GET {
            let query: Vec<(String, String)> = input
                .iter()
                .map(|(key, value)| (key.clone(), binder::value_to_string(value)))
                .collect();
            request = request.query(&query);
        } else if let Some(body) = configuration.get("body") {
            let body = template_text(body, input);
            let content_type = if serde_json::from_str::<Value>(&body).is_ok() {
                "application/json"
            } else {
                "text/plain"
            };
            request = request.header("Content-Type", content_type).body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;
        let status = response.status();
        let content = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&content).unwrap_or(Value::Null);

        tracing::info!("📡 HTTP request completed: {} {} (status: {})", method, url, status);

        let mut result = result_map(json!({
            "isSuccess": status.is_success(),
            "statusCode": status.as_u16(),
            "content": content,
            "data": data,
        }));
        if !status.is_success() {
            result.insert("error".into(), json!(format!("HTTP request returned status {}", status)));
        }
        Ok(result)
    }

    async fn database_query(&self, configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
        let connection_string = config_str(configuration, "connectionString").unwrap_or_default();
        let query = binder::bind(config_str(configuration, "query").unwrap_or_default(), input);
        let (sql, parameters) = rewrite_named_parameters(&query);
        let pool = self.pool(connection_string).await?;

        tracing::debug!("📝 SQL Query: {}", sql);
        let mut statement = sqlx::query(&sql);
        for name in &parameters {
            statement = match input.get(name) {
                Some(Value::String(text)) => statement.bind(text.clone()),
                Some(Value::Number(number)) => match number.as_i64() {
                    Some(integer) => statement.bind(integer),
                    None => statement.bind(number.as_f64()),
                },
                Some(Value::Bool(flag)) => statement.bind(*flag),
                Some(Value::Null) | None => statement.bind(None::<String>),
                Some(other) => statement.bind(other.to_string()),
            };
        }

        if query.trim_start().to_uppercase().starts_with("SELECT") {
            let rows = statement
                .fetch_all(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Database query failed: {}", e))?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;

            tracing::info!("✅ Database query successful: {} rows returned", rows.len());
            Ok(result_map(json!({
                "isSuccess": true,
                "rowCount": rows.len(),
                "rows": rows,
            })))
        } else {
            let outcome = statement
                .execute(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Database statement failed: {}", e))?;

            tracing::info!("✅ Database statement successful: {} rows affected", outcome.rows_affected());
            Ok(result_map(json!({
                "isSuccess": true,
                "rowsAffected": outcome.rows_affected(),
            })))
        }
    }

    /// Get or create the pool for a connection string
    async fn pool(&self, connection_string: &str) -> Result<SqlitePool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(connection_string) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self.pools.write().await;

        // Double-check pattern
        if let Some(pool) = pools.get(connection_string) {
            return Ok(pool.clone());
        }

        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| anyhow::anyhow!("Invalid connection string '{}': {}", connection_string, e))?
            .create_if_missing(true);

        // Every connection to an in-memory database sees its own database
        let pool = if connection_string.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePoolOptions::new().connect_with(options).await
        }
        .map_err(|e| anyhow::anyhow!("Failed to connect to '{}': {}", connection_string, e))?;

        tracing::info!("🗄️ Created query database pool: {}", connection_string);
        pools.insert(connection_string.to_string(), pool.clone());
        Ok(pool)
    }

    async fn send_email(&self, configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
        let relay = config_str(configuration, "relayUrl")
            .map(str::to_string)
            .or_else(|| self.mail_relay_url.clone())
            .ok_or_else(|| anyhow::anyhow!("No mail relay configured"))?;

        let message = json!({
            "from": configuration.get("from").map(|v| template_text(v, input)).unwrap_or_default(),
            "to": configuration.get("to").map(|v| template_text(v, input)).unwrap_or_default(),
            "subject": configuration.get("subject").map(|v| template_text(v, input)).unwrap_or_default(),
            "body": configuration.get("body").map(|v| template_text(v, input)).unwrap_or_default(),
        });

        tracing::debug!("✉️ Sending email to {} via {}", message["to"], relay);
        let response = self
            .client
            .post(&relay)
            .json(&message)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Mail relay request failed: {}", e))?;
        let status = response.status();

        let mut result = result_map(json!({
            "isSuccess": status.is_success(),
            "statusCode": status.as_u16(),
            "to": message["to"],
        }));
        if !status.is_success() {
            result.insert("error".into(), json!(format!("Mail relay returned status {}", status)));
        }
        Ok(result)
    }

    async fn call_webhook(&self, configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
        let url = binder::bind(config_str(configuration, "url").unwrap_or_default(), input);
        let secret = config_str(configuration, "secret").unwrap_or_default();
        let header = config_str(configuration, "signatureHeader").unwrap_or(DEFAULT_SIGNATURE_HEADER);

        let payload = match configuration.get("payload") {
            Some(template) => template_text(template, input),
            None => serde_json::to_string(input)?,
        };
        let signature = sign_payload(secret, payload.as_bytes())?;

        tracing::debug!("🪝 Calling webhook {} ({} bytes)", url, payload.len());
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(header, format!("sha256={}", signature))
            .body(payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))?;
        let status = response.status();
        let content = response.text().await.unwrap_or_default();

        let mut result = result_map(json!({
            "isSuccess": status.is_success(),
            "statusCode": status.as_u16(),
            "content": content,
            "signature": signature,
        }));
        if !status.is_success() {
            result.insert("error".into(), json!(format!("Webhook returned status {}", status)));
        }
        Ok(result)
    }
}

#[async_trait]
impl IntegrationExecutor for DefaultIntegrationExecutor {
    async fn execute(&self, step_type: &StepType, configuration: &DataMap, input: &DataMap) -> DataMap {
        match self.dispatch(step_type, configuration, input).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("⚠️ {:?} integration failed: {}", step_type, e);
                result_map(json!({ "isSuccess": false, "error": e.to_string() }))
            }
        }
    }
}

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Rewrite `@name` parameters to positional `?`, returning the names in order
///
/// Text inside single-quoted literals is left untouched.
pub fn rewrite_named_parameters(query: &str) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(query.len());
    let mut names = Vec::new();
    let mut chars = query.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            sql.push(c);
            continue;
        }

        let starts_name = chars.peek().is_some_and(|next| next.is_ascii_alphabetic() || *next == '_');
        if c == '@' && !in_literal && starts_name {
            let mut name = String::new();
            while let Some(next) = chars.peek().copied().filter(|n| n.is_ascii_alphanumeric() || *n == '_') {
                name.push(next);
                chars.next();
            }
            names.push(name);
            sql.push('?');
        } else {
            sql.push(c);
        }
    }

    (sql, names)
}

fn run_script(configuration: &DataMap, input: &DataMap) -> Result<DataMap> {
    let script = binder::bind(config_str(configuration, "script").unwrap_or_default(), input);

    let lua = lua::sandbox()?;
    lua::set_global(&lua, "input", &Value::Object(input.clone()))?;
    let result = lua::eval_json(&lua, &script)?;

    tracing::debug!("📜 Script produced: {}", result);
    Ok(result_map(json!({ "isSuccess": true, "result": result })))
}

fn row_to_json(row: &SqliteRow) -> Result<Value> {
    let mut record = serde_json::Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(i)
            .map_err(|e| anyhow::anyhow!("Failed to read column '{}': {}", column.name(), e))?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => row.try_get::<i64, _>(i).map(Value::from),
                "REAL" => row.try_get::<f64, _>(i).map(Value::from),
                "BLOB" => row.try_get::<Vec<u8>, _>(i).map(|bytes| Value::from(hex::encode(bytes))),
                _ => row.try_get::<String, _>(i).map(Value::from),
            }
            .map_err(|e| anyhow::anyhow!("Failed to decode column '{}': {}", column.name(), e))?
        };

        record.insert(column.name().to_string(), value);
    }

    Ok(Value::Object(record))
}

fn config_str<'a>(configuration: &'a DataMap, key: &str) -> Option<&'a str> {
    configuration.get(key).and_then(Value::as_str)
}

/// Bind a string template, or bind the serialized form of any other JSON
fn template_text(value: &Value, input: &DataMap) -> String {
    match value {
        Value::String(template) => binder::bind(template, input),
        other => binder::bind(&other.to_string(), input),
    }
}

fn result_map(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        _ => DataMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> DataMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn reports_missing_configuration() {
        let executor = DefaultIntegrationExecutor::default();
        let config = map(json!({ "url": "https://example.test", "secret": "" }));

        assert!(executor.validate(&StepType::HttpRequest, &config));
        assert_eq!(executor.missing_configuration(&StepType::Webhook, &config), vec!["secret"]);
        assert_eq!(
            executor.missing_configuration(&StepType::DatabaseQuery, &DataMap::new()),
            vec!["connectionString", "query"]
        );
        assert!(executor.validate(&StepType::Action, &DataMap::new()));
    }

    #[tokio::test]
    async fn invalid_url_is_a_failed_result() {
        let executor = DefaultIntegrationExecutor::default();
        let result = executor
            .execute(&StepType::HttpRequest, &map(json!({ "url": "not a url" })), &DataMap::new())
            .await;

        assert_eq!(result["isSuccess"], json!(false));
        assert!(result["error"].as_str().unwrap().contains("HTTP request failed"));
    }

    #[tokio::test]
    async fn missing_configuration_fails_without_dispatch() {
        let executor = DefaultIntegrationExecutor::default();
        let result = executor.execute(&StepType::ScriptExecution, &DataMap::new(), &DataMap::new()).await;

        assert_eq!(result["isSuccess"], json!(false));
        assert_eq!(result["error"], json!("Missing required configuration: script"));
    }

    #[tokio::test]
    async fn email_without_relay_fails() {
        let executor = DefaultIntegrationExecutor::default();
        let config = map(json!({ "to": "ops@example.test", "subject": "Hi ${name}" }));
        let result = executor.execute(&StepType::EmailSend, &config, &DataMap::new()).await;

        assert_eq!(result["isSuccess"], json!(false));
        assert_eq!(result["error"], json!("No mail relay configured"));
    }

    #[test]
    fn signs_payload_with_hmac_sha256() {
        let signature = sign_payload("key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(signature, "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8");
    }

    #[test]
    fn rewrites_named_parameters_outside_literals() {
        let (sql, names) = rewrite_named_parameters("SELECT * FROM users WHERE email = @email AND note != 'a@b' AND id = @id");
        assert_eq!(sql, "SELECT * FROM users WHERE email = ? AND note != 'a@b' AND id = ?");
        assert_eq!(names, vec!["email", "id"]);
    }

    #[tokio::test]
    async fn runs_sqlite_statements_and_queries() {
        let executor = DefaultIntegrationExecutor::default();
        let query = |sql: &str| map(json!({ "connectionString": "sqlite::memory:", "query": sql }));

        let created = executor
            .execute(&StepType::DatabaseQuery, &query("CREATE TABLE items (id INTEGER, name TEXT, price REAL)"), &DataMap::new())
            .await;
        assert_eq!(created["isSuccess"], json!(true), "{:?}", created);

        let inserted = executor
            .execute(
                &StepType::DatabaseQuery,
                &query("INSERT INTO items (id, name, price) VALUES (@id, @name, @price)"),
                &map(json!({ "id": 1, "name": "widget", "price": 2.5 })),
            )
            .await;
        assert_eq!(inserted["rowsAffected"], json!(1));

        let selected = executor
            .execute(
                &StepType::DatabaseQuery,
                &query("SELECT id, name, price FROM items WHERE name = @name"),
                &map(json!({ "name": "widget" })),
            )
            .await;
        assert_eq!(selected["isSuccess"], json!(true));
        assert_eq!(selected["rowCount"], json!(1));
        assert_eq!(selected["rows"], json!([{ "id": 1, "name": "widget", "price": 2.5 }]));
    }

    #[tokio::test]
    async fn runs_scripts_against_input() {
        let executor = DefaultIntegrationExecutor::default();
        let config = map(json!({ "script": "return { total = input.qty * input.price }" }));
        let result = executor
            .execute(&StepType::ScriptExecution, &config, &map(json!({ "qty": 3, "price": 4 })))
            .await;

        assert_eq!(result["isSuccess"], json!(true));
        assert_eq!(result["result"], json!({ "total": 12 }));
    }

    #[tokio::test]
    async fn runaway_scripts_fail_instead_of_hanging() {
        let executor = DefaultIntegrationExecutor::default();
        let config = map(json!({ "script": "while true do end" }));

        let result = tokio::time::timeout(
            Duration::from_secs(20),
            executor.execute(&StepType::ScriptExecution, &config, &DataMap::new()),
        )
        .await
        .unwrap();

        assert_eq!(result["isSuccess"], json!(false));
        assert!(result["error"].as_str().unwrap().contains("time limit"));
    }

    #[tokio::test]
    async fn non_integration_steps_are_rejected() {
        let executor = DefaultIntegrationExecutor::default();
        let result = executor.execute(&StepType::Wait, &DataMap::new(), &DataMap::new()).await;
        assert_eq!(result["isSuccess"], json!(false));
    }
}
