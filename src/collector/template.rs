//! 요청 템플릿 확장
//!
//! `${var:name}`은 변수 저장소의 값으로 치환되고, `${lookup:name}`은
//! 저장된 lookup 값마다 요청 하나로 확장됩니다. 서로 다른 lookup이 여럿이면
//! 모든 조합(cartesian product)이 만들어집니다.

use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::BTreeMap;

use crate::config::Api;
use crate::context::ScratchStores;

static VAR_RE: OnceCell<Regex> = OnceCell::new();
static LOOKUP_RE: OnceCell<Regex> = OnceCell::new();

fn var_regex() -> &'static Regex {
    VAR_RE.get_or_init(|| Regex::new(r"\$\{var:([^}]+)\}").expect("invalid variable regex"))
}

fn lookup_regex() -> &'static Regex {
    LOOKUP_RE.get_or_init(|| Regex::new(r"\$\{lookup:([^}]+)\}").expect("invalid lookup regex"))
}

/// `${var:name}` 치환, 알 수 없는 변수는 그대로 남김
pub fn substitute_variables(text: &str, variables: &BTreeMap<String, String>) -> String {
    if !text.contains("${var:") {
        return text.to_string();
    }
    var_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 텍스트가 참조하는 lookup 이름 (등장 순서, 중복 없음)
pub fn lookup_names(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in lookup_regex().captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn substitute_lookups(text: &str, values: &BTreeMap<String, String>) -> String {
    if values.is_empty() || !text.contains("${lookup:") {
        return text.to_string();
    }
    lookup_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 템플릿이 적용되는 API 필드들
fn template_fields(api: &Api) -> Vec<&str> {
    let mut fields = vec![api.url.as_str(), api.file.as_str(), api.payload.as_str()];
    fields.extend(api.headers.iter().map(|(_, v)| v));
    fields.extend(api.commands.iter().map(|c| c.run.as_str()));
    fields.extend(api.db_queries.iter().map(|c| c.run.as_str()));
    fields
}

fn render_api(
    api: &Api,
    variables: &BTreeMap<String, String>,
    lookups: &BTreeMap<String, String>,
) -> Api {
    let render = |text: &str| substitute_lookups(&substitute_variables(text, variables), lookups);

    let mut rendered = api.clone();
    rendered.url = render(&api.url);
    rendered.file = render(&api.file);
    rendered.payload = render(&api.payload);
    rendered.headers = api.headers.iter().map(|(k, v)| (k, render(v))).collect();
    for command in rendered.commands.iter_mut().chain(rendered.db_queries.iter_mut()) {
        command.run = render(&command.run);
    }
    rendered
}

/// API를 fetch 단위로 확장
///
/// 참조된 lookup이 비어 있으면 빈 목록을 반환합니다 (fetch 생략).
pub fn expand_api(api: &Api, stores: &ScratchStores) -> Vec<Api> {
    let mut names: Vec<String> = Vec::new();
    for field in template_fields(api) {
        for name in lookup_names(field) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let mut combinations: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for name in &names {
        let values = match stores.lookups.get(name) {
            Some(values) if !values.is_empty() => values,
            _ => {
                tracing::debug!(api = %api.name, lookup = %name, "Lookup is empty, skipping fetch");
                return Vec::new();
            }
        };
        combinations = combinations
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.insert(name.clone(), value.clone());
                    next
                })
            })
            .collect();
    }

    combinations
        .iter()
        .map(|combo| render_api(api, &stores.variables, combo))
        .collect()
}
