//! 셸 명령 실행
//!
//! 명령은 `shell -c <run>`으로 실행되며 명령마다 타임아웃이 적용됩니다.
//! 타임아웃이 발생하면 자식 프로세스는 종료되고 해당 명령만 실패합니다.
//! `commands_async`가 설정되면 세마포어로 제한된 동시 실행을 사용합니다.

use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use super::{FetchedUnit, RawOutput};
use crate::config::{Api, Command, DEFAULT_DIAL_TIMEOUT_MS, DEFAULT_SHELL, DEFAULT_TIMEOUT_MS};
use crate::context::ScratchStores;
use crate::error::{FetchError, FetchResult};

/// TCP 연결 가능 여부 확인
pub async fn dial(address: &str, network: &str) -> FetchResult<()> {
    if !network.is_empty() && !network.starts_with("tcp") {
        return Err(FetchError::Unsupported(format!("dial network '{}'", network)));
    }

    let timeout = Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS);
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(FetchError::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(FetchError::Dial {
            address: address.to_string(),
            reason: format!("timed out after {}ms", DEFAULT_DIAL_TIMEOUT_MS),
        }),
    }
}

/// 셸로 명령을 실행하고 표준 출력을 반환
#[instrument(skip(run), fields(shell = %shell, timeout_ms = timeout_ms))]
pub async fn run_shell(shell: &str, run: &str, timeout_ms: u64) -> FetchResult<String> {
    let mut cmd = tokio::process::Command::new(shell);
    cmd.arg("-c")
        .arg(run)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_millis(timeout_ms), cmd.output()).await {
        Ok(result) => result?,
        Err(_) => return Err(FetchError::timeout_with_duration(timeout_ms)),
    };

    if !output.status.success() {
        return Err(FetchError::CommandFailed {
            command: run.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(bytes = output.stdout.len(), "Command finished");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn command_timeout(command: &Command, api: &Api) -> u64 {
    match (command.timeout, api.timeout) {
        (0, 0) => DEFAULT_TIMEOUT_MS,
        (0, a) => a,
        (c, _) => c,
    }
}

fn command_shell<'a>(command: &'a Command, api: &'a Api) -> &'a str {
    if !command.shell.is_empty() {
        &command.shell
    } else if !api.shell.is_empty() {
        &api.shell
    } else {
        DEFAULT_SHELL
    }
}

/// 명령 하나 실행, `ignore_output`이면 `None`
async fn run_command(
    command: &Command,
    api: &Api,
    cached: Option<Vec<Value>>,
) -> FetchResult<Option<FetchedUnit>> {
    if !command.cache.is_empty() {
        let rows = cached.ok_or_else(|| FetchError::MissingCache(command.cache.clone()))?;
        return Ok(Some(FetchedUnit::from_command(
            command,
            api,
            RawOutput::Json(Value::Array(rows)),
        )));
    }

    if !command.dial.is_empty() {
        dial(&command.dial, &command.network).await?;
    }

    let stdout = run_shell(
        command_shell(command, api),
        &command.run,
        command_timeout(command, api),
    )
    .await?;

    if command.ignore_output {
        return Ok(None);
    }

    let output = if command.output == "json" {
        RawOutput::Json(
            serde_json::from_str(&stdout).map_err(|e| FetchError::JsonParse(e.to_string()))?,
        )
    } else {
        RawOutput::Text(stdout)
    };
    Ok(Some(FetchedUnit::from_command(command, api, output)))
}

fn cached_rows(command: &Command, stores: &ScratchStores) -> Option<Vec<Value>> {
    if command.cache.is_empty() {
        None
    } else {
        stores.datastore.get(&command.cache).cloned()
    }
}

/// API의 명령들을 실행
///
/// 동기 모드에서는 선언 순서대로 하나씩, 비동기 모드에서는 동시에
/// 실행합니다. 결과는 어느 쪽이든 선언 순서로 반환됩니다.
pub async fn run_commands(api: &Api, stores: &ScratchStores) -> Vec<FetchResult<FetchedUnit>> {
    if api.commands_async && api.commands.len() > 1 {
        return run_commands_async(api, stores).await;
    }

    let mut results = Vec::with_capacity(api.commands.len());
    for command in &api.commands {
        let cached = cached_rows(command, stores);
        if let Some(result) = run_command(command, api, cached).await.transpose() {
            results.push(result);
        }
    }
    results
}

async fn run_commands_async(api: &Api, stores: &ScratchStores) -> Vec<FetchResult<FetchedUnit>> {
    let count = api.commands.len();
    let limit = match api.commands_async_limit {
        0 => count,
        n => n.min(count),
    };
    debug!(api = %api.name, commands = count, limit = limit, "Running commands concurrently");

    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let shared = Arc::new(api.clone());
    let mut set = JoinSet::new();

    for (index, command) in api.commands.iter().cloned().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let api = Arc::clone(&shared);
        let cached = cached_rows(&command, stores);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            (index, run_command(&command, &api, cached).await)
        });
    }

    join_in_order(set, count, &api.name)
        .await
        .into_iter()
        .filter_map(|result| result.transpose())
        .collect()
}

/// 완료된 작업을 선언 순서로 정렬
///
/// panic 또는 취소된 작업은 결과 대신 `FetchError::TaskFailed`로 채워져
/// 일반 수집 실패와 같이 집계됩니다.
async fn join_in_order<T: 'static>(
    mut set: JoinSet<(usize, FetchResult<T>)>,
    count: usize,
    api_name: &str,
) -> Vec<FetchResult<T>> {
    let mut slots: Vec<Option<FetchResult<T>>> = (0..count).map(|_| None).collect();
    let mut failures = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => {
                tracing::error!(api = %api_name, error = %e, "Command task failed");
                failures.push(e.to_string());
            }
        }
    }

    // JoinError does not carry the index, so failures fill the empty slots
    let mut failures = failures.into_iter();
    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Some(result) => Some(result),
            None => failures.next().map(|reason| Err(FetchError::TaskFailed(reason))),
        })
        .collect()
}
