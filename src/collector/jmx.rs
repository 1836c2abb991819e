//! Jolokia JMX 클라이언트
//!
//! Jolokia 에이전트(`http://host:port/jolokia`)에 read 요청을 보내고, 각 MBean을
//! `bean` 속성을 가진 JSON 객체 하나로 변환합니다.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::http::build_client;
use crate::config::{JmxConfig, TlsConfig};
use crate::error::{FetchError, FetchResult};

/// Jolokia HTTP 클라이언트
#[derive(Debug, Clone)]
pub struct JolokiaClient {
    client: Client,
    base_url: String,
    timeout_ms: u64,
    auth: Option<(String, String)>,
}

/// Jolokia 요청 구조체
#[derive(Debug, Serialize)]
struct JolokiaRequest {
    #[serde(rename = "type")]
    request_type: String,
    mbean: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribute: Option<AttributeSpec>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AttributeSpec {
    Single(String),
    Multiple(Vec<String>),
}

/// Jolokia 응답 구조체
#[derive(Debug, Deserialize)]
struct JolokiaResponse {
    #[serde(default)]
    value: Option<Value>,
    status: u16,
    #[serde(default)]
    error: Option<String>,
}

impl JolokiaClient {
    /// 새 클라이언트 생성
    ///
    /// # Arguments
    /// * `base_url` - Jolokia 엔드포인트 URL (예: "http://localhost:8778/jolokia")
    /// * `timeout_ms` - 요청 타임아웃 (밀리초)
    pub fn new(base_url: &str, timeout_ms: u64) -> FetchResult<Self> {
        let client = build_client(timeout_ms, "", &TlsConfig::default())?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms,
            auth: None,
        })
    }

    /// JMX 설정으로 클라이언트 생성 (사용자가 있으면 Basic Auth)
    pub fn from_config(jmx: &JmxConfig, timeout_ms: u64) -> FetchResult<Self> {
        let client = Self::new(&jmx.endpoint(), timeout_ms)?;
        Ok(if jmx.user.is_empty() {
            client
        } else {
            client.with_auth(&jmx.user, &jmx.pass)
        })
    }

    /// Basic Auth 설정
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 단일 MBean (또는 패턴) 조회, 응답의 `value` 반환
    #[instrument(skip(self), fields(mbean = %mbean))]
    pub async fn read_mbean(&self, mbean: &str, attributes: Option<&[String]>) -> FetchResult<Value> {
        let request = JolokiaRequest {
            request_type: "read".to_string(),
            mbean: mbean.to_string(),
            attribute: attributes.map(|attrs| {
                if attrs.len() == 1 {
                    AttributeSpec::Single(attrs[0].clone())
                } else {
                    AttributeSpec::Multiple(attrs.to_vec())
                }
            }),
        };

        debug!("Sending Jolokia read request");

        let mut req = self.client.post(&self.base_url).json(&request);

        if let Some((username, password)) = &self.auth {
            req = req.basic_auth(username, Some(password));
        }

        let timeout_ms = self.timeout_ms;
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout_with_duration(timeout_ms)
            } else {
                FetchError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await.map_err(FetchError::HttpResponse)?;
        let parsed: JolokiaResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::JsonParse(e.to_string()))?;

        if parsed.status != 200 {
            return Err(FetchError::Jolokia {
                status: parsed.status,
                message: parsed.error.unwrap_or_else(|| "read failed".to_string()),
            });
        }

        Ok(parsed.value.unwrap_or(Value::Null))
    }

    /// MBean 패턴 조회 결과를 bean 객체 목록으로 변환
    pub async fn read_beans(&self, mbean: &str) -> FetchResult<Vec<Value>> {
        let value = self.read_mbean(mbean, None).await?;
        Ok(beans_from_value(mbean, value))
    }
}

/// 와일드카드 응답인지 확인 (키가 모두 ObjectName 형태이고 값이 객체)
fn is_wildcard(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map
            .iter()
            .all(|(k, v)| k.contains(':') && k.contains('=') && v.is_object())
}

/// Jolokia `value`를 MBean별 객체로 변환
///
/// 단일 MBean 응답은 요청한 이름을 `bean`으로, 와일드카드 응답은 각
/// ObjectName을 `bean`으로 사용합니다. 객체가 아닌 값은 `value` 속성이 됩니다.
pub fn beans_from_value(mbean: &str, value: Value) -> Vec<Value> {
    fn bean(name: &str, attrs: Value) -> Value {
        let mut obj = match attrs {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        obj.insert("bean".to_string(), Value::String(name.to_string()));
        Value::Object(obj)
    }

    match value {
        Value::Null => Vec::new(),
        Value::Object(map) if is_wildcard(&map) => {
            map.into_iter().map(|(name, attrs)| bean(&name, attrs)).collect()
        }
        other => vec![bean(mbean, other)],
    }
}

/// 도메인이 생략된 MBean 이름에 기본 도메인을 붙임
pub fn qualify_mbean(run: &str, domain: &str) -> String {
    if run.contains(':') || domain.is_empty() {
        run.to_string()
    } else {
        format!("{}:{}", domain, run)
    }
}
