//! Raw output normalizer
//!
//! Splits raw text output into attribute maps, one per logical record.
//!
//! Two layouts are supported:
//!
//! - *vertical*: every line is a `key<split_by>value` pair, all pairs of a
//!   block are merged into one record
//! - *horizontal*: a header row supplies column names and every data row
//!   becomes a record
//!
//! ```text
//! Filesystem  Size  Used        row_header = 0
//! /dev/sda1   100G  42G    ->   {Filesystem: /dev/sda1, Size: 100G, Used: 42G}
//! ```

use regex::Regex;

use crate::config::{Api, Command, RegexMatch};
use crate::error::StageError;

use super::sample::{infer_value, Attributes};

/// Delimiter used by vertical splits when none is configured
pub const DEFAULT_VERTICAL_SPLIT: &str = ":";

/// Text splitting options, resolved from a command or its API
#[derive(Debug, Clone, Default)]
pub struct SplitOptions {
    pub horizontal: bool,
    pub split_by: String,
    pub regex: bool,
    pub group_by: String,
    pub split_output: String,
    pub row_header: usize,
    pub row_start: usize,
    pub set_header: Vec<String>,
    pub header_split_by: String,
    pub header_regex: bool,
    pub line_start: usize,
    pub line_end: usize,
    pub regex_matches: Vec<RegexMatch>,
}

impl SplitOptions {
    /// Options for API-level text output (url/file sources)
    pub fn from_api(api: &Api) -> Self {
        Self {
            horizontal: api.split == "horizontal",
            split_by: api.split_by.clone(),
            regex: api.regex,
            row_header: api.row_header,
            row_start: api.row_start,
            set_header: api.set_header.clone(),
            ..Default::default()
        }
    }

    /// Options for a command; unset fields fall back to the API
    pub fn from_command(command: &Command, api: &Api) -> Self {
        let base = Self::from_api(api);
        let split = if command.split.is_empty() {
            &api.split
        } else {
            &command.split
        };
        Self {
            horizontal: split == "horizontal",
            split_by: if command.split_by.is_empty() {
                base.split_by
            } else {
                command.split_by.clone()
            },
            regex: command.regex_match || (command.split_by.is_empty() && base.regex),
            group_by: command.group_by.clone(),
            split_output: command.split_output.clone(),
            row_header: if command.row_header > 0 {
                command.row_header
            } else {
                base.row_header
            },
            row_start: if command.row_start > 0 {
                command.row_start
            } else {
                base.row_start
            },
            set_header: if command.set_header.is_empty() {
                base.set_header
            } else {
                command.set_header.clone()
            },
            header_split_by: command.header_split_by.clone(),
            header_regex: command.header_regex_match,
            line_start: command.line_start,
            line_end: command.line_end,
            regex_matches: command.regex_matches.clone(),
        }
    }
}

/// Token delimiter: literal, regex, or runs of whitespace
#[derive(Debug, Clone)]
enum Delimiter {
    Whitespace,
    Literal(String),
    Pattern(Regex),
}

impl Delimiter {
    fn compile(split_by: &str, regex: bool, directive: &'static str) -> Result<Self, StageError> {
        if split_by.is_empty() {
            Ok(Delimiter::Whitespace)
        } else if regex {
            Regex::new(split_by)
                .map(Delimiter::Pattern)
                .map_err(|e| StageError::pattern(directive, split_by, e))
        } else {
            Ok(Delimiter::Literal(split_by.to_string()))
        }
    }

    fn tokens(&self, line: &str) -> Vec<String> {
        match self {
            Delimiter::Whitespace => line.split_whitespace().map(str::to_string).collect(),
            Delimiter::Literal(d) => line.split(d.as_str()).map(|t| t.trim().to_string()).collect(),
            Delimiter::Pattern(re) => {
                let mut tokens: Vec<String> =
                    re.split(line).map(|t| t.trim().to_string()).collect();
                // a leading match (e.g. indentation) yields an empty first token
                if tokens.first().is_some_and(|t| t.is_empty()) {
                    tokens.remove(0);
                }
                tokens
            }
        }
    }

    fn key_value(&self, line: &str) -> Option<(String, String)> {
        let (k, v) = match self {
            Delimiter::Whitespace => {
                let trimmed = line.trim();
                let idx = trimmed.find(char::is_whitespace)?;
                (trimmed[..idx].to_string(), trimmed[idx..].to_string())
            }
            Delimiter::Literal(d) => {
                let (k, v) = line.split_once(d.as_str())?;
                (k.to_string(), v.to_string())
            }
            Delimiter::Pattern(re) => {
                if re.captures_len() >= 3 {
                    let caps = re.captures(line)?;
                    (
                        caps.get(1)?.as_str().to_string(),
                        caps.get(2)?.as_str().to_string(),
                    )
                } else {
                    let mut parts = re.splitn(line, 2);
                    let k = parts.next()?.to_string();
                    let v = parts.next()?.to_string();
                    (k, v)
                }
            }
        };
        let k = k.trim().to_string();
        if k.is_empty() {
            return None;
        }
        Some((k, v.trim().to_string()))
    }
}

#[derive(Debug, Clone)]
struct CompiledRegexMatch {
    regex: Regex,
    keys: Vec<String>,
    keys_multi: Vec<String>,
}

/// Compiled text splitter
#[derive(Debug, Clone)]
pub struct TextSplitter {
    options: SplitOptions,
    body: Delimiter,
    header: Delimiter,
    split_output: Option<Regex>,
    regex_matches: Vec<CompiledRegexMatch>,
}

impl TextSplitter {
    /// Compile the delimiters and patterns of the given options
    pub fn compile(options: SplitOptions) -> Result<Self, StageError> {
        let body = if options.split_by.is_empty() && !options.horizontal {
            Delimiter::Literal(DEFAULT_VERTICAL_SPLIT.to_string())
        } else {
            Delimiter::compile(&options.split_by, options.regex, "split_by")?
        };
        let header = if options.header_split_by.is_empty() {
            body.clone()
        } else {
            Delimiter::compile(
                &options.header_split_by,
                options.header_regex,
                "header_split_by",
            )?
        };
        let split_output = if options.split_output.is_empty() {
            None
        } else {
            Some(
                Regex::new(&options.split_output)
                    .map_err(|e| StageError::pattern("split_output", &options.split_output, e))?,
            )
        };
        let regex_matches = options
            .regex_matches
            .iter()
            .map(|m| {
                Regex::new(&m.expression)
                    .map(|regex| CompiledRegexMatch {
                        regex,
                        keys: m.keys.clone(),
                        keys_multi: m.keys_multi.clone(),
                    })
                    .map_err(|e| StageError::pattern("regex_matches", &m.expression, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            options,
            body,
            header,
            split_output,
            regex_matches,
        })
    }

    /// Split raw text into records
    pub fn split(&self, text: &str) -> Vec<Attributes> {
        let lines = self.windowed_lines(text);

        if !self.regex_matches.is_empty() {
            return self.apply_regex_matches(&lines.join("\n"));
        }

        let blocks = self.blocks(&lines);
        if self.options.horizontal {
            let rows: Vec<String> = if self.is_grouped() {
                blocks
                    .iter()
                    .map(|b| {
                        b.iter()
                            .map(|l| l.trim())
                            .filter(|l| !l.is_empty())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .collect()
            } else {
                blocks.into_iter().flatten().collect()
            };
            self.split_horizontal(&rows)
        } else {
            blocks
                .iter()
                .map(|block| self.split_vertical(block))
                .filter(|attrs| !attrs.is_empty())
                .collect()
        }
    }

    fn is_grouped(&self) -> bool {
        !self.options.group_by.is_empty() || self.split_output.is_some()
    }

    fn windowed_lines(&self, text: &str) -> Vec<String> {
        let lines: Vec<String> = text
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect();
        let start = self.options.line_start.min(lines.len());
        let end = if self.options.line_end > 0 {
            self.options.line_end.min(lines.len()).max(start)
        } else {
            lines.len()
        };
        lines[start..end].to_vec()
    }

    fn blocks(&self, lines: &[String]) -> Vec<Vec<String>> {
        if !self.options.group_by.is_empty() {
            let joined = lines.join("\n");
            return joined
                .split(self.options.group_by.as_str())
                .map(|block| block.lines().map(str::to_string).collect::<Vec<_>>())
                .filter(|block| block.iter().any(|l| !l.trim().is_empty()))
                .collect();
        }

        if let Some(re) = &self.split_output {
            let mut blocks: Vec<Vec<String>> = Vec::new();
            for line in lines {
                if re.is_match(line) || blocks.is_empty() {
                    blocks.push(Vec::new());
                }
                if let Some(current) = blocks.last_mut() {
                    current.push(line.clone());
                }
            }
            return blocks;
        }

        vec![lines.to_vec()]
    }

    fn split_vertical(&self, lines: &[String]) -> Attributes {
        let mut attrs = Attributes::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if let Some((k, v)) = self.body.key_value(line) {
                attrs.insert(k, infer_value(&v));
            }
        }
        attrs
    }

    fn split_horizontal(&self, rows: &[String]) -> Vec<Attributes> {
        let rows: Vec<&String> = rows.iter().filter(|r| !r.trim().is_empty()).collect();

        let (header, data_start) = if !self.options.set_header.is_empty() {
            (self.options.set_header.clone(), self.options.row_start)
        } else {
            let Some(header_row) = rows.get(self.options.row_header) else {
                return Vec::new();
            };
            let start = if self.options.row_start > self.options.row_header {
                self.options.row_start
            } else {
                self.options.row_header + 1
            };
            (self.header.tokens(header_row), start)
        };

        if header.is_empty() {
            return Vec::new();
        }

        rows.iter()
            .skip(data_start)
            .map(|row| {
                let mut tokens = self.body.tokens(row);
                // the last column absorbs any surplus tokens (e.g. a command line with spaces)
                if tokens.len() > header.len() {
                    let rest = tokens.split_off(header.len() - 1).join(" ");
                    tokens.push(rest);
                }
                header
                    .iter()
                    .zip(tokens)
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, token)| (name.clone(), infer_value(&token)))
                    .collect::<Attributes>()
            })
            .filter(|attrs| !attrs.is_empty())
            .collect()
    }

    fn apply_regex_matches(&self, text: &str) -> Vec<Attributes> {
        let mut single = Attributes::new();
        let mut multi = Vec::new();

        for m in &self.regex_matches {
            if !m.keys_multi.is_empty() {
                for caps in m.regex.captures_iter(text) {
                    let attrs: Attributes = m
                        .keys_multi
                        .iter()
                        .enumerate()
                        .filter_map(|(i, key)| {
                            caps.get(i + 1)
                                .map(|c| (key.clone(), infer_value(c.as_str())))
                        })
                        .collect();
                    if !attrs.is_empty() {
                        multi.push(attrs);
                    }
                }
            }
            if !m.keys.is_empty() {
                if let Some(caps) = m.regex.captures(text) {
                    for (i, key) in m.keys.iter().enumerate() {
                        if let Some(c) = caps.get(i + 1) {
                            single.insert(key.clone(), infer_value(c.as_str()));
                        }
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(multi.len() + 1);
        if !single.is_empty() {
            records.push(single);
        }
        records.extend(multi);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn splitter(options: SplitOptions) -> TextSplitter {
        TextSplitter::compile(options).unwrap()
    }

    #[test]
    fn test_vertical_default_colon() {
        let s = splitter(SplitOptions::default());
        let records = s.split("uptime: 120\nversion: 1.2.3\nnot a pair\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["uptime"], json!(120));
        assert_eq!(records[0]["version"], json!("1.2.3"));
    }

    #[test]
    fn test_vertical_regex_captures() {
        let s = splitter(SplitOptions {
            split_by: r"^(\w+)\s*=\s*(.*)$".into(),
            regex: true,
            ..Default::default()
        });
        let records = s.split("conns = 12\nstate = ok");
        assert_eq!(records[0]["conns"], json!(12));
        assert_eq!(records[0]["state"], json!("ok"));
    }

    #[test]
    fn test_horizontal_header_and_rows() {
        let s = splitter(SplitOptions {
            horizontal: true,
            ..Default::default()
        });
        let records = s.split("NAME CPU MEM\nweb 1.5 200\ndb 3 512\nworker 0.1 64\n");
        assert_eq!(records.len(), 3);
        for record in &records {
            let keys: Vec<&str> = record.keys().map(|k| k.as_str()).collect();
            assert_eq!(keys, vec!["CPU", "MEM", "NAME"]);
        }
        assert_eq!(records[1]["NAME"], json!("db"));
        assert_eq!(records[1]["CPU"], json!(3));
    }

    #[test]
    fn test_horizontal_separate_header_delimiter() {
        let s = splitter(SplitOptions {
            horizontal: true,
            split_by: ",".into(),
            header_split_by: "|".into(),
            ..Default::default()
        });
        let records = s.split("a|b\n1,2\n");
        assert_eq!(records, vec![[("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
            .into_iter()
            .collect::<Attributes>()]);
    }

    #[test]
    fn test_horizontal_set_header_row_start() {
        let s = splitter(SplitOptions {
            horizontal: true,
            set_header: vec!["pid".into(), "cmd".into()],
            row_start: 1,
            ..Default::default()
        });
        let records = s.split("PID CMD\n1 /sbin/init splash\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["cmd"], json!("/sbin/init splash"));
    }

    #[test]
    fn test_group_by_vertical_blocks() {
        let s = splitter(SplitOptions {
            group_by: "\n\n".into(),
            ..Default::default()
        });
        let records = s.split("name: a\nsize: 1\n\nname: b\nsize: 2\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["name"], json!("b"));
    }

    #[test]
    fn test_split_output_blocks() {
        let s = splitter(SplitOptions {
            split_output: r"^Device".into(),
            ..Default::default()
        });
        let records = s.split("Device: sda\nreads: 1\nDevice: sdb\nreads: 2\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Device"], json!("sda"));
        assert_eq!(records[1]["reads"], json!(2));
    }

    #[test]
    fn test_line_window() {
        let s = splitter(SplitOptions {
            line_start: 1,
            line_end: 2,
            ..Default::default()
        });
        let records = s.split("a: 1\nb: 2\nc: 3\n");
        assert_eq!(records.len(), 1);
        assert!(records[0].contains_key("b"));
        assert_eq!(records[0].len(), 1);
    }

    #[test]
    fn test_regex_matches() {
        let s = splitter(SplitOptions {
            regex_matches: vec![
                RegexMatch {
                    expression: r"load average: ([\d.]+)".into(),
                    keys: vec!["load1".into()],
                    keys_multi: vec![],
                },
                RegexMatch {
                    expression: r"(\w+)=(\d+)".into(),
                    keys: vec![],
                    keys_multi: vec!["name".into(), "value".into()],
                },
            ],
            ..Default::default()
        });
        let records = s.split("load average: 0.75\nx=1 y=2");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["load1"], json!(0.75));
        assert_eq!(records[2]["name"], json!("y"));
    }

    #[test]
    fn test_invalid_regex_is_stage_error() {
        let err = TextSplitter::compile(SplitOptions {
            split_by: "(".into(),
            regex: true,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, StageError::InvalidPattern { directive: "split_by", .. }));
    }
}
