//! HTTP 소스 클라이언트
//!
//! Connection pooling과 타임아웃을 지원하는 비동기 HTTP 클라이언트입니다.
//! 전역(global) 설정과 API 설정을 합쳐 요청을 구성하며, API 값이 우선합니다.

use reqwest::{Certificate, Client, ClientBuilder, Method, Proxy};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::config::{Api, Global, StringMap, TlsConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{FetchError, FetchResult};

/// 설정된 값 중 비어 있지 않은 첫 값
fn first_set<'a>(top: &'a str, base: &'a str) -> &'a str {
    if top.is_empty() {
        base
    } else {
        top
    }
}

/// 요청 URL 해석
///
/// 상대 경로는 `base_url`에 이어 붙이고, `escape_url`이면 쿼리를
/// 다시 인코딩합니다.
pub fn resolve_url(url: &str, base_url: &str, escape: bool) -> FetchResult<Url> {
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let mut resolved = match Url::parse(url) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) if !base_url.is_empty() => {
            let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
            base.join(url).map_err(|e| invalid(e.to_string()))?
        }
        Err(e) => return Err(invalid(e.to_string())),
    };

    if escape && resolved.query().is_some() {
        let pairs: Vec<(String, String)> = resolved
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        resolved.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(resolved)
}

/// HTTP 소스
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: Url,
    method: Method,
    payload: String,
    headers: StringMap,
    auth: Option<(String, String)>,
    timeout_ms: u64,
}

impl HttpSource {
    /// API 설정으로 HTTP 소스 생성
    ///
    /// # Errors
    /// URL, 메서드, 프록시 또는 CA 설정이 잘못된 경우
    pub fn from_api(api: &Api, global: &Global) -> FetchResult<Self> {
        let timeout_ms = match (api.timeout, global.timeout) {
            (0, 0) => DEFAULT_TIMEOUT_MS,
            (0, g) => g,
            (a, _) => a,
        };

        let tls = if api.tls_config.enable || api.tls_config.insecure_skip_verify {
            &api.tls_config
        } else {
            &global.tls_config
        };
        let proxy = first_set(&api.proxy, &global.proxy);
        let client = build_client(timeout_ms, proxy, tls)?;

        let url = resolve_url(&api.url, &global.base_url, api.escape_url)?;

        let method_name = if api.method.is_empty() {
            "GET".to_string()
        } else {
            api.method.to_uppercase()
        };
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| FetchError::Unsupported(format!("HTTP method '{}'", api.method)))?;

        let mut headers = global.headers.clone();
        for (k, v) in api.headers.iter() {
            headers.insert(k, v);
        }

        let user = first_set(&api.user, &global.user);
        let auth = if user.is_empty() {
            None
        } else {
            Some((
                user.to_string(),
                first_set(&api.pass, &global.pass).to_string(),
            ))
        };

        Ok(Self {
            client,
            url,
            method,
            payload: api.payload.clone(),
            headers,
            auth,
            timeout_ms,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// 요청을 보내고 응답 본문을 반환
    #[instrument(skip(self), fields(url = %self.url, method = %self.method))]
    pub async fn fetch(&self) -> FetchResult<String> {
        let mut req = self.client.request(self.method.clone(), self.url.clone());

        for (name, value) in self.headers.iter() {
            req = req.header(name, value);
        }
        if let Some((username, password)) = &self.auth {
            req = req.basic_auth(username, Some(password));
        }
        if !self.payload.is_empty() {
            req = req.body(self.payload.clone());
        }

        debug!("Sending HTTP request");

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

        response.text().await.map_err(FetchError::HttpResponse)
    }
}

/// 공통 클라이언트 설정으로 reqwest 클라이언트 생성
pub fn build_client(timeout_ms: u64, proxy: &str, tls: &TlsConfig) -> FetchResult<Client> {
    let mut builder = ClientBuilder::new()
        .timeout(Duration::from_millis(timeout_ms))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30));

    if !proxy.is_empty() {
        builder = builder.proxy(Proxy::all(proxy).map_err(FetchError::HttpClientInit)?);
    }
    if tls.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if !tls.ca.is_empty() {
        let pem = std::fs::read(&tls.ca)?;
        let cert = Certificate::from_pem(&pem).map_err(FetchError::HttpClientInit)?;
        builder = builder.add_root_certificate(cert);
    }

    builder.build().map_err(FetchError::HttpClientInit)
}
