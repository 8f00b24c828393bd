//! Job descriptions and the description compiler.
//!
//! A description is a ClassAd-style attribute list:
//!
//! ```text
//! [
//!     Executable = "run.sh";
//!     Arguments = "-n 5";
//!     Site = {"LCG.CERN.cern", "LCG.RAL.uk"};
//!     Priority = 3;
//! ]
//! ```
//!
//! Values are strings, integers, `{...}` lists, or bare expressions which are
//! kept verbatim. Attribute names are case-insensitive.

use async_trait::async_trait;
use std::fmt;

use crate::database::models::job::{AttrValue, JobAttributes, JobColumn};
use crate::database::models::task_queue::{DEFAULT_CPU_TIME, TaskQueueDefinition};
use crate::{Error, Result};

/// Most jobs a parametric description may expand into.
pub const MAX_PARAMETRIC_JOBS: usize = 20;

const MIN_CPU_TIME: i64 = 100;
const MAX_CPU_TIME: i64 = 500_000;
const DEFAULT_PRIORITY: i64 = 1;
const MAX_PRIORITY: i64 = 10;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum JdlValue {
    Str(String),
    Int(i64),
    List(Vec<JdlValue>),
    Expr(String),
}

impl JdlValue {
    /// Value as plain text (strings unquoted).
    pub fn as_text(&self) -> String {
        match self {
            Self::Str(s) | Self::Expr(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::List(items) => items
                .iter()
                .map(JdlValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn substitute(&mut self, pattern: &str, replacement: &str) {
        match self {
            Self::Str(s) | Self::Expr(s) => *s = s.replace(pattern, replacement),
            Self::Int(_) => {}
            Self::List(items) => items
                .iter_mut()
                .for_each(|item| item.substitute(pattern, replacement)),
        }
    }
}

impl fmt::Display for JdlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::Int(i) => write!(f, "{i}"),
            Self::Expr(e) => f.write_str(e),
            Self::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// An ordered attribute list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDescription {
    attributes: Vec<(String, JdlValue)>,
}

impl JobDescription {
    /// Parse a description. The outer brackets are optional.
    pub fn parse(text: &str) -> Result<Self> {
        let body = text.trim();
        let body = match body.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| Error::syntax("Unbalanced brackets"))?,
            None => body,
        };

        let mut description = Self::default();
        for statement in split_top_level(body, ';')? {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            let (name, value) = statement
                .split_once('=')
                .ok_or_else(|| Error::syntax(format!("Expected 'Name = value' in '{statement}'")))?;
            let name = name.trim();
            if !is_identifier(name) {
                return Err(Error::syntax(format!("Invalid attribute name '{name}'")));
            }
            description.set(name, parse_value(value.trim())?);
        }
        Ok(description)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&JdlValue> {
        self.position(name).map(|i| &self.attributes[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Insert or replace an attribute, keeping its original position.
    pub fn set(&mut self, name: &str, value: JdlValue) {
        match self.position(name) {
            Some(i) => self.attributes[i].1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<JdlValue> {
        self.position(name).map(|i| self.attributes.remove(i).1)
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            JdlValue::List(_) => None,
            value => Some(value.as_text()),
        }
    }

    /// Integer attribute; `Err` when present but not an integer.
    pub fn try_get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(JdlValue::Int(i)) => Ok(Some(*i)),
            Some(JdlValue::Str(s) | JdlValue::Expr(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::syntax(format!("{name} must be an integer, got '{s}'"))),
            Some(JdlValue::List(_)) => Err(Error::syntax(format!("{name} must be an integer"))),
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.try_get_int(name).ok().flatten()
    }

    /// Attribute as a list of strings; scalars become a one-element list and
    /// comma-separated strings are split.
    pub fn get_list(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            None => Vec::new(),
            Some(JdlValue::List(items)) => items
                .iter()
                .map(|item| item.as_text().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(value) => value
                .as_text()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Replace `pattern` in every attribute value.
    pub fn substitute(&mut self, pattern: &str, replacement: &str) {
        for (_, value) in &mut self.attributes {
            value.substitute(pattern, replacement);
        }
    }

    pub fn is_parametric(&self) -> bool {
        self.contains("Parameters")
    }

    /// Single site summary: "ANY" for none, "Multiple" for several.
    pub fn site_summary(&self) -> String {
        let sites = self.get_list("Site");
        match sites.as_slice() {
            [] => "ANY".to_string(),
            [site] => site.clone(),
            _ => "Multiple".to_string(),
        }
    }

    /// Expand a parametric description into one description per parameter.
    ///
    /// `Parameters` is either a list of values or a count, in which case the
    /// values are generated from `ParameterStart`, `ParameterStep` and
    /// `ParameterFactor` (defaults 0, 1, 1). In each copy `%s` is replaced by
    /// the value and `%n` by its index, and `Parameter` holds the value.
    pub fn expand_parametric(&self) -> Result<Vec<JobDescription>> {
        let values: Vec<JdlValue> = match self.get("Parameters") {
            None => return Ok(vec![self.clone()]),
            Some(JdlValue::List(items)) => items.clone(),
            Some(_) => {
                let count = self
                    .try_get_int("Parameters")?
                    .ok_or_else(|| Error::syntax("Parameters must be a list or an integer"))?;
                if count < 1 {
                    return Err(Error::syntax("Parameters must be a positive integer"));
                }
                if count as usize > MAX_PARAMETRIC_JOBS {
                    return Err(Error::validation(format!(
                        "Parametric job cannot expand into more than {MAX_PARAMETRIC_JOBS} jobs"
                    )));
                }
                let start = self.try_get_int("ParameterStart")?.unwrap_or(0);
                let step = self.try_get_int("ParameterStep")?.unwrap_or(1);
                let factor = self.try_get_int("ParameterFactor")?.unwrap_or(1);
                let mut current = start;
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(JdlValue::Int(current));
                    current = current.saturating_mul(factor).saturating_add(step);
                }
                values
            }
        };

        if values.is_empty() {
            return Err(Error::syntax("Parameters must not be empty"));
        }
        if values.len() > MAX_PARAMETRIC_JOBS {
            return Err(Error::validation(format!(
                "Parametric job cannot expand into more than {MAX_PARAMETRIC_JOBS} jobs"
            )));
        }

        let mut template = self.clone();
        for key in ["Parameters", "ParameterStart", "ParameterStep", "ParameterFactor"] {
            template.remove(key);
        }

        Ok(values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let mut job = template.clone();
                job.substitute("%s", &value.as_text());
                job.substitute("%n", &index.to_string());
                job.set("Parameter", value);
                job
            })
            .collect())
    }
}

impl fmt::Display for JobDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[")?;
        for (name, value) in &self.attributes {
            writeln!(f, "    {name} = {value};")?;
        }
        write!(f, "]")
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split on `separator` outside strings, braces, brackets and parentheses.
fn split_top_level(text: &str, separator: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::syntax(format!("Unexpected '{c}'")));
                }
            }
            _ if c == separator && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if in_string {
        return Err(Error::syntax("Unterminated string"));
    }
    if depth != 0 {
        return Err(Error::syntax("Unbalanced brackets"));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_string_literal(text: &str) -> Result<Option<String>> {
    let Some(inner) = text.strip_prefix('"') else {
        return Ok(None);
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => out.push(next),
                None => return Err(Error::syntax("Unterminated string")),
            },
            '"' => {
                return if chars.as_str().trim().is_empty() {
                    Ok(Some(out))
                } else {
                    // "a" + "b" and friends are expressions
                    Ok(None)
                };
            }
            c => out.push(c),
        }
    }
    Err(Error::syntax("Unterminated string"))
}

fn parse_value(text: &str) -> Result<JdlValue> {
    if text.is_empty() {
        return Err(Error::syntax("Missing value"));
    }
    if let Some(inner) = text.strip_prefix('{') {
        let inner = inner
            .strip_suffix('}')
            .ok_or_else(|| Error::syntax(format!("Unterminated list '{text}'")))?;
        let items = split_top_level(inner, ',')?
            .into_iter()
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(parse_value)
            .collect::<Result<Vec<_>>>()?;
        return Ok(JdlValue::List(items));
    }
    if let Some(s) = parse_string_literal(text)? {
        return Ok(JdlValue::Str(s));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(JdlValue::Int(i));
    }
    Ok(JdlValue::Expr(text.to_string()))
}

/// Identity the job is submitted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOwner {
    pub owner: String,
    pub owner_group: String,
    pub vo: String,
}

impl JobOwner {
    pub fn new(
        owner: impl Into<String>,
        owner_group: impl Into<String>,
        vo: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            owner_group: owner_group.into(),
            vo: vo.into(),
        }
    }
}

/// Output of the description compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledJob {
    pub description: JobDescription,
    pub owner: JobOwner,
}

impl CompiledJob {
    /// Compiled description text.
    pub fn jdl(&self) -> String {
        self.description.to_string()
    }

    pub fn priority(&self) -> i64 {
        self.description.get_int("Priority").unwrap_or(0)
    }

    pub fn input_data(&self) -> Vec<String> {
        self.description.get_list("InputData")
    }

    pub fn task_queue_definition(&self) -> TaskQueueDefinition {
        TaskQueueDefinition::from_description(
            &self.description,
            &self.owner.owner,
            &self.owner.owner_group,
            &self.owner.vo,
        )
    }

    /// Job-table attributes derived from the description.
    pub fn attributes(&self) -> JobAttributes {
        let d = &self.description;
        let mut attrs = JobAttributes::new();
        attrs.insert(JobColumn::Owner, self.owner.owner.as_str().into());
        attrs.insert(JobColumn::OwnerGroup, self.owner.owner_group.as_str().into());
        attrs.insert(JobColumn::Vo, self.owner.vo.as_str().into());
        attrs.insert(
            JobColumn::JobName,
            d.get_string("JobName").unwrap_or_else(|| "Unknown".into()).into(),
        );
        attrs.insert(
            JobColumn::JobType,
            d.get_string("JobType").unwrap_or_else(|| "User".into()).into(),
        );
        attrs.insert(
            JobColumn::JobGroup,
            d.get_string("JobGroup").unwrap_or_else(|| "00000000".into()).into(),
        );
        attrs.insert(JobColumn::Site, d.site_summary().into());
        attrs.insert(JobColumn::UserPriority, AttrValue::Int(self.priority()));
        attrs
    }
}

/// Turns a raw description into a validated, owner-stamped one.
#[async_trait]
pub trait DescriptionCompiler: Send + Sync {
    /// Fails with [`Error::SyntaxError`] when the description is invalid.
    async fn compile(&self, raw: &str, owner: &JobOwner) -> Result<CompiledJob>;
}

/// Default compiler for ClassAd-style descriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct JdlCompiler;

impl JdlCompiler {
    fn check_range(
        description: &mut JobDescription,
        name: &str,
        default: i64,
        min: i64,
        max: i64,
    ) -> Result<()> {
        let value = description.try_get_int(name)?.unwrap_or(default);
        if !(min..=max).contains(&value) {
            return Err(Error::syntax(format!(
                "Value for {name} must be between {min} and {max}, got {value}"
            )));
        }
        description.set(name, JdlValue::Int(value));
        Ok(())
    }
}

#[async_trait]
impl DescriptionCompiler for JdlCompiler {
    async fn compile(&self, raw: &str, owner: &JobOwner) -> Result<CompiledJob> {
        let mut description = JobDescription::parse(raw)?;

        match description.get_string("Executable") {
            Some(exe) if !exe.trim().is_empty() => {}
            _ => return Err(Error::syntax("Missing mandatory attribute Executable")),
        }

        Self::check_range(
            &mut description,
            "CPUTime",
            DEFAULT_CPU_TIME,
            MIN_CPU_TIME,
            MAX_CPU_TIME,
        )?;
        Self::check_range(&mut description, "Priority", DEFAULT_PRIORITY, 0, MAX_PRIORITY)?;

        if !description.contains("JobType") {
            description.set("JobType", JdlValue::Str("User".into()));
        }
        description.set("Owner", JdlValue::Str(owner.owner.clone()));
        description.set("OwnerGroup", JdlValue::Str(owner.owner_group.clone()));
        description.set("VirtualOrganization", JdlValue::Str(owner.vo.clone()));

        Ok(CompiledJob {
            description,
            owner: owner.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> JobOwner {
        JobOwner::new("alice", "lhcb_user", "lhcb")
    }

    #[test]
    fn test_parse_values() {
        let d = JobDescription::parse(
            r#"[
                Executable = "echo";
                Arguments = "say \"hi\"; bye";
                Priority = 4;
                Site = {"A", "B"};
                Requirements = other.Memory > 2048;
            ]"#,
        )
        .unwrap();

        assert_eq!(d.get_string("executable").as_deref(), Some("echo"));
        assert_eq!(d.get_string("Arguments").as_deref(), Some("say \"hi\"; bye"));
        assert_eq!(d.get_int("Priority"), Some(4));
        assert_eq!(d.get_list("Site"), vec!["A", "B"]);
        assert_eq!(
            d.get("Requirements"),
            Some(&JdlValue::Expr("other.Memory > 2048".into()))
        );
        assert_eq!(d.site_summary(), "Multiple");
    }

    #[test]
    fn test_brackets_are_optional_and_output_reparses() {
        let d = JobDescription::parse(r#"Executable = "a"; InputData = {"/lfn/1", "/lfn/2"}"#)
            .unwrap();
        let again = JobDescription::parse(&d.to_string()).unwrap();
        assert_eq!(d, again);
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            r#"[Executable = "unterminated]"#,
            r#"[Executable "x";]"#,
            r#"[Site = {"A", "B";]"#,
            r#"[1abc = 3;]"#,
        ] {
            assert!(
                matches!(JobDescription::parse(bad), Err(Error::SyntaxError(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn test_parametric_list_expansion() {
        let d = JobDescription::parse(
            r#"[Executable = "run"; Arguments = "%s-%n"; Parameters = {"a", "b", "c"};]"#,
        )
        .unwrap();
        assert!(d.is_parametric());

        let jobs = d.expand_parametric().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[1].get_string("Arguments").as_deref(), Some("b-1"));
        assert_eq!(jobs[2].get_string("Parameter").as_deref(), Some("c"));
        assert!(!jobs[0].is_parametric());
    }

    #[test]
    fn test_parametric_count_expansion() {
        let d = JobDescription::parse(
            r#"[Executable = "run"; Arguments = "%s"; Parameters = 3; ParameterStart = 10; ParameterStep = 5;]"#,
        )
        .unwrap();
        let args: Vec<_> = d
            .expand_parametric()
            .unwrap()
            .iter()
            .map(|job| job.get_string("Arguments").unwrap())
            .collect();
        assert_eq!(args, vec!["10", "15", "20"]);

        let too_many = JobDescription::parse(r#"[Executable = "run"; Parameters = 21;]"#).unwrap();
        assert!(matches!(too_many.expand_parametric(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_compile_stamps_owner_and_defaults() {
        let job = JdlCompiler
            .compile(r#"[Executable = "run.sh"; JobName = "test";]"#, &owner())
            .await
            .unwrap();

        assert_eq!(job.description.get_string("Owner").as_deref(), Some("alice"));
        assert_eq!(
            job.description.get_string("VirtualOrganization").as_deref(),
            Some("lhcb")
        );
        assert_eq!(job.description.get_int("CPUTime"), Some(DEFAULT_CPU_TIME));
        assert_eq!(job.priority(), DEFAULT_PRIORITY);

        let attrs = job.attributes();
        assert_eq!(attrs[&JobColumn::JobName], AttrValue::Text("test".into()));
        assert_eq!(attrs[&JobColumn::Site], AttrValue::Text("ANY".into()));
        assert_eq!(attrs[&JobColumn::JobType], AttrValue::Text("User".into()));
    }

    #[tokio::test]
    async fn test_compile_rejects_invalid_descriptions() {
        let missing = JdlCompiler.compile(r#"[Arguments = "x";]"#, &owner()).await;
        assert!(matches!(missing, Err(Error::SyntaxError(_))));

        let bad_priority = JdlCompiler
            .compile(r#"[Executable = "x"; Priority = 11;]"#, &owner())
            .await;
        assert!(matches!(bad_priority, Err(Error::SyntaxError(_))));

        let bad_cpu = JdlCompiler
            .compile(r#"[Executable = "x"; CPUTime = "lots";]"#, &owner())
            .await;
        assert!(matches!(bad_cpu, Err(Error::SyntaxError(_))));
    }
}
