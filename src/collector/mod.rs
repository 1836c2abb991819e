//! 소스 수집 모듈
//!
//! 설정된 API마다 소스 종류([`SourceKind`])를 선택하고, 원시 출력(JSON 또는
//! 텍스트)을 [`FetchedUnit`] 목록으로 수집합니다. 실패는 단위별로 격리되어
//! 다른 단위와 소스는 계속 진행됩니다.
//!
//! # Example
//!
//! ```ignore
//! use flex_collector::collector::Dispatcher;
//!
//! let dispatcher = Dispatcher::new();
//! for result in dispatcher.fetch(&config.global, &api, &stores).await {
//!     // ...
//! }
//! ```

mod command;
mod http;
mod jmx;
pub mod template;

pub use command::{dial, run_commands, run_shell};
pub use http::{resolve_url, HttpSource};
pub use jmx::{beans_from_value, JolokiaClient};

use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{Api, Command, Global, StringMap, DEFAULT_TIMEOUT_MS};
use crate::context::ScratchStores;
use crate::error::{FetchError, FetchResult};
use crate::transformer::{Attributes, SplitOptions};

/// 수명 `'a`를 가지는 boxed future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 원시 출력
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// JSON 문서
    Json(Value),
    /// 분할(split) 대상 텍스트
    Text(String),
    /// Prometheus exposition 텍스트
    Prometheus(String),
}

/// 수집된 단위 하나 (API 응답 또는 명령 하나의 출력)
#[derive(Debug, Clone)]
pub struct FetchedUnit {
    /// 로그용 이름 (명령 이름, 없으면 API 이름)
    pub name: String,
    /// 명령이 지정한 이벤트 타입
    pub event_type: Option<String>,
    pub output: RawOutput,
    /// 텍스트 분할 옵션
    pub split: SplitOptions,
    /// 명령 단위 custom attributes
    pub custom_attributes: StringMap,
}

impl FetchedUnit {
    /// API 수준 출력 (url, file, cache)
    pub fn from_api(api: &Api, output: RawOutput) -> Self {
        Self {
            name: api.name.clone(),
            event_type: None,
            output,
            split: SplitOptions::from_api(api),
            custom_attributes: StringMap::new(),
        }
    }

    /// 명령 출력
    pub fn from_command(command: &Command, api: &Api, output: RawOutput) -> Self {
        let name = if command.name.is_empty() {
            api.name.clone()
        } else {
            command.name.clone()
        };
        Self {
            name,
            event_type: (!command.event_type.is_empty()).then(|| command.event_type.clone()),
            output,
            split: SplitOptions::from_command(command, api),
            custom_attributes: command.custom_attributes.clone(),
        }
    }
}

/// JSON으로 파싱되면 JSON, 아니면 텍스트
fn detect_output(body: String) -> RawOutput {
    match serde_json::from_str::<Value>(&body) {
        Ok(value) if value.is_object() || value.is_array() => RawOutput::Json(value),
        _ => RawOutput::Text(body),
    }
}

/// 데이터베이스 질의 백엔드
///
/// SQL 드라이버는 외부에서 주입합니다. 각 행은 컬럼 이름 -> 값 맵입니다.
pub trait QueryBackend: Send + Sync {
    fn query<'a>(
        &'a self,
        driver: &'a str,
        connection: &'a str,
        query: &'a str,
    ) -> BoxFuture<'a, FetchResult<Vec<Attributes>>>;
}

/// 소스 종류
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// 이전 API의 datastore 항목
    Cache(String),
    File(PathBuf),
    Http { prometheus: bool },
    Database,
    Jmx,
    Shell,
}

impl SourceKind {
    /// 소스 선택자를 순서대로 확인
    ///
    /// cache, file, url (prometheus 포함), database, jmx, commands
    pub fn select(api: &Api) -> FetchResult<Self> {
        if !api.cache.is_empty() {
            Ok(SourceKind::Cache(api.cache.clone()))
        } else if !api.file.is_empty() {
            Ok(SourceKind::File(PathBuf::from(&api.file)))
        } else if !api.url.is_empty() {
            Ok(SourceKind::Http {
                prometheus: api.prometheus.enable,
            })
        } else if !api.database.is_empty() && !api.db_queries.is_empty() {
            Ok(SourceKind::Database)
        } else if !api.commands.is_empty()
            && (api.jmx.is_configured() || api.commands.iter().any(|c| c.jmx.is_configured()))
        {
            Ok(SourceKind::Jmx)
        } else if !api.commands.is_empty() {
            Ok(SourceKind::Shell)
        } else {
            Err(FetchError::NoSource(api.name.clone()))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Cache(_) => "cache",
            SourceKind::File(_) => "file",
            SourceKind::Http { prometheus: false } => "http",
            SourceKind::Http { prometheus: true } => "prometheus",
            SourceKind::Database => "database",
            SourceKind::Jmx => "jmx",
            SourceKind::Shell => "shell",
        }
    }

    /// 소스에서 단위 목록 수집
    pub async fn fetch(
        &self,
        global: &Global,
        api: &Api,
        stores: &ScratchStores,
        backend: Option<&dyn QueryBackend>,
    ) -> Vec<FetchResult<FetchedUnit>> {
        match self {
            SourceKind::Cache(name) => vec![fetch_cache(api, name, stores)],
            SourceKind::File(path) => vec![fetch_file(api, path).await],
            SourceKind::Http { prometheus } => vec![fetch_http(api, global, *prometheus).await],
            SourceKind::Database => fetch_database(api, stores, backend).await,
            SourceKind::Jmx => fetch_jmx(api, global).await,
            SourceKind::Shell => run_commands(api, stores).await,
        }
    }
}

fn fetch_cache(api: &Api, name: &str, stores: &ScratchStores) -> FetchResult<FetchedUnit> {
    let rows = stores
        .datastore
        .get(name)
        .cloned()
        .ok_or_else(|| FetchError::MissingCache(name.to_string()))?;
    Ok(FetchedUnit::from_api(api, RawOutput::Json(Value::Array(rows))))
}

async fn fetch_file(api: &Api, path: &Path) -> FetchResult<FetchedUnit> {
    let body = tokio::fs::read_to_string(path).await?;
    Ok(FetchedUnit::from_api(api, detect_output(body)))
}

async fn fetch_http(api: &Api, global: &Global, prometheus: bool) -> FetchResult<FetchedUnit> {
    let source = HttpSource::from_api(api, global)?;
    let body = source.fetch().await?;
    let output = if prometheus {
        RawOutput::Prometheus(body)
    } else {
        detect_output(body)
    };
    Ok(FetchedUnit::from_api(api, output))
}

async fn fetch_database(
    api: &Api,
    stores: &ScratchStores,
    backend: Option<&dyn QueryBackend>,
) -> Vec<FetchResult<FetchedUnit>> {
    let mut results = Vec::with_capacity(api.db_queries.len());
    for query in &api.db_queries {
        let result = if !query.cache.is_empty() {
            stores
                .datastore
                .get(&query.cache)
                .cloned()
                .ok_or_else(|| FetchError::MissingCache(query.cache.clone()))
        } else {
            match backend {
                Some(backend) => backend
                    .query(&api.db_driver, &api.db_conn, &query.run)
                    .await
                    .map(|rows| {
                        rows.into_iter()
                            .map(|row| Value::Object(row.into_iter().collect::<Map<_, _>>()))
                            .collect()
                    }),
                None => Err(FetchError::Unsupported(format!(
                    "database '{}' without a query backend",
                    api.database
                ))),
            }
        };
        results.push(result.map(|rows| {
            FetchedUnit::from_command(query, api, RawOutput::Json(Value::Array(rows)))
        }));
    }
    results
}

async fn fetch_jmx(api: &Api, global: &Global) -> Vec<FetchResult<FetchedUnit>> {
    let base = api.jmx.merged_over(&global.jmx);
    let mut results = Vec::with_capacity(api.commands.len());

    for command in &api.commands {
        let endpoint = command.jmx.merged_over(&base);
        let timeout_ms = [command.timeout, api.timeout, global.timeout]
            .into_iter()
            .find(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let mbean = jmx::qualify_mbean(&command.run, &endpoint.domain);

        let result = match JolokiaClient::from_config(&endpoint, timeout_ms) {
            Ok(client) => client.read_beans(&mbean).await,
            Err(e) => Err(e),
        };
        results.push(result.map(|beans| {
            debug!(mbean = %mbean, beans = beans.len(), "MBeans read");
            FetchedUnit::from_command(command, api, RawOutput::Json(Value::Array(beans)))
        }));
    }
    results
}

/// 소스 디스패처
///
/// 템플릿을 확장한 뒤 API마다 소스를 선택해 수집합니다.
#[derive(Clone, Default)]
pub struct Dispatcher {
    backend: Option<Arc<dyn QueryBackend>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터베이스 백엔드 설정
    pub fn with_backend(mut self, backend: Arc<dyn QueryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// API 하나를 수집
    ///
    /// `${lookup:..}` 확장으로 요청이 여러 개가 될 수 있으며, 참조한
    /// lookup이 비어 있으면 아무것도 수집하지 않습니다.
    #[instrument(skip_all, fields(api = %api.name))]
    pub async fn fetch(
        &self,
        global: &Global,
        api: &Api,
        stores: &ScratchStores,
    ) -> Vec<FetchResult<FetchedUnit>> {
        let mut units = Vec::new();
        for expanded in template::expand_api(api, stores) {
            let kind = match SourceKind::select(&expanded) {
                Ok(kind) => kind,
                Err(e) => {
                    units.push(Err(e));
                    continue;
                }
            };
            debug!(source = kind.name(), "Fetching");
            units.extend(
                kind.fetch(global, &expanded, stores, self.backend.as_deref())
                    .await,
            );
        }
        units
    }
}
