// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory model of a zone configuration.
//!
//! The model understands the subset of `zonecfg` syntax produced by
//! `zonecfg export`, and can render edits back into `zonecfg` subcommands.
//! Both the CLI backend and the fake backend apply edits through it, so the
//! two agree on resource matching and singleton rules.

use crate::zone::{ErrorCode, Property, PropertyValue, Resource, ZoneError};

/// Resource kinds which may appear at most once in a configuration.
pub const SINGLETON_KINDS: &[&str] = &[
    "global",
    "rootzpool",
    "capped-memory",
    "capped-cpu",
    "virtual-cpu",
    "dedicated-cpu",
    "suspend",
];

/// Properties which hold a list of values added one at a time with
/// `add <prop> <value>` inside a resource scope.
const ADDED_LIST_PROPERTIES: &[&str] = &["storage"];

pub fn is_singleton(kind: &str) -> bool {
    SINGLETON_KINDS.contains(&kind)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot parse zone configuration at line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

/// A single configuration edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigEdit {
    Add(Resource),
    Set { filter: Resource, properties: Vec<Property> },
    Remove(Resource),
    Clear { filter: Resource, properties: Vec<String> },
}

impl ConfigEdit {
    /// Renders the edit as `zonecfg` subcommands.
    pub fn script(&self) -> Vec<String> {
        match self {
            ConfigEdit::Add(resource) if resource.kind == "global" => {
                resource.properties.iter().map(set_command).collect()
            }
            ConfigEdit::Add(resource) => {
                let mut lines = vec![format!("add {}", resource.kind)];
                lines.extend(resource.properties.iter().flat_map(|p| {
                    if ADDED_LIST_PROPERTIES.contains(&p.name.as_str()) {
                        list_values(&p.value)
                            .into_iter()
                            .map(|v| format!("add {} {}", p.name, quote(&v)))
                            .collect::<Vec<_>>()
                    } else {
                        vec![set_command(p)]
                    }
                }));
                lines.push("end".to_string());
                lines
            }
            ConfigEdit::Set { filter, properties } => {
                scoped(filter, properties.iter().map(set_command))
            }
            ConfigEdit::Remove(filter) => {
                vec![format!("remove -F {}", selector(filter))]
            }
            ConfigEdit::Clear { filter, properties } => {
                scoped(filter, properties.iter().map(|p| format!("clear {p}")))
            }
        }
    }
}

fn list_values(value: &PropertyValue) -> Vec<String> {
    match value {
        PropertyValue::Simple(v) => vec![v.clone()],
        PropertyValue::List(vs) => vs.clone(),
    }
}

fn scoped(
    filter: &Resource,
    body: impl Iterator<Item = String>,
) -> Vec<String> {
    if filter.kind == "global" {
        return body.collect();
    }
    let mut lines = vec![format!("select {}", selector(filter))];
    lines.extend(body);
    lines.push("end".to_string());
    lines
}

fn selector(filter: &Resource) -> String {
    std::iter::once(filter.kind.clone())
        .chain(
            filter
                .properties
                .iter()
                .map(|p| format!("{}={}", p.name, render_value(&p.value))),
        )
        .collect::<Vec<_>>()
        .join(" ")
}

fn set_command(p: &Property) -> String {
    format!("set {}={}", p.name, render_value(&p.value))
}

fn render_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Simple(v) => quote(v),
        PropertyValue::List(vs) => format!(
            "({})",
            vs.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",")
        ),
    }
}

fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || "-_./:@%+".contains(c)
        });
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', "\\\""))
    }
}

/// An ordered list of configuration resources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneConfiguration {
    resources: Vec<Resource>,
}

impl ZoneConfiguration {
    pub fn new(resources: Vec<Resource>) -> Self {
        let mut config = Self { resources };
        config.ensure_global();
        config
    }

    fn ensure_global(&mut self) {
        if !self.resources.iter().any(|r| r.kind == "global") {
            self.resources.insert(0, Resource::kind("global"));
        }
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Returns every resource selected by `filter`.
    pub fn select(&self, filter: &Resource) -> Vec<Resource> {
        self.resources.iter().filter(|r| r.matches(filter)).cloned().collect()
    }

    /// Returns the requested properties of the first selected resource.
    ///
    /// Properties without a value are omitted. Selecting nothing is a
    /// `RESOURCE_NOT_FOUND` error.
    pub fn properties(
        &self,
        filter: &Resource,
        names: &[&str],
    ) -> Result<Vec<Property>, ZoneError> {
        let resource = self
            .resources
            .iter()
            .find(|r| r.matches(filter))
            .ok_or_else(|| not_found(filter))?;
        Ok(names
            .iter()
            .filter_map(|name| resource.property(name).cloned())
            .collect())
    }

    pub fn apply(&mut self, edit: &ConfigEdit) -> Result<(), ZoneError> {
        match edit {
            ConfigEdit::Add(resource) => {
                if is_singleton(&resource.kind)
                    && self.resources.iter().any(|r| r.kind == resource.kind)
                {
                    return Err(ZoneError::new(
                        ErrorCode::ResourceAlreadyExists,
                        format!("resource '{}' already exists", resource.kind),
                    ));
                }
                self.resources.push(resource.clone());
            }
            ConfigEdit::Set { filter, properties } => {
                let resource = self.select_one(filter)?;
                for p in properties {
                    match resource
                        .properties
                        .iter_mut()
                        .find(|existing| existing.name == p.name)
                    {
                        Some(existing) => existing.value = p.value.clone(),
                        None => resource.properties.push(p.clone()),
                    }
                }
            }
            ConfigEdit::Remove(filter) => {
                let before = self.resources.len();
                self.resources.retain(|r| !r.matches(filter));
                if self.resources.len() == before {
                    return Err(not_found(filter));
                }
                self.ensure_global();
            }
            ConfigEdit::Clear { filter, properties } => {
                let resource = self.select_one(filter)?;
                resource.properties.retain(|p| !properties.contains(&p.name));
            }
        }
        Ok(())
    }

    fn select_one(
        &mut self,
        filter: &Resource,
    ) -> Result<&mut Resource, ZoneError> {
        let mut selected =
            self.resources.iter_mut().filter(|r| r.matches(filter));
        let first = selected.next().ok_or_else(|| not_found(filter))?;
        if selected.next().is_some() {
            return Err(ZoneError::new(
                ErrorCode::ResourceTooMany,
                format!("more than one '{}' resource matches", filter.kind),
            ));
        }
        Ok(first)
    }

    /// Renders the configuration in `zonecfg export` form.
    pub fn export(&self) -> String {
        let mut lines = vec!["create -b".to_string()];
        for resource in &self.resources {
            lines.extend(ConfigEdit::Add(resource.clone()).script());
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Parses the output of `zonecfg export`.
    pub fn parse_export(text: &str) -> Result<Self, ParseError> {
        let mut resources = vec![Resource::kind("global")];
        let mut current: Option<Resource> = None;

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let err = |message: String| ParseError { line: n + 1, message };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (verb, rest) =
                line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            match verb {
                "create" => {}
                "end" => match current.take() {
                    Some(resource) => resources.push(resource),
                    None => return Err(err("'end' outside a resource".into())),
                },
                "set" => {
                    let (name, value) = rest
                        .split_once('=')
                        .ok_or_else(|| err(format!("malformed set: {rest}")))?;
                    let property = Property {
                        name: name.trim().to_string(),
                        value: parse_value(value.trim()),
                    };
                    let target = match current.as_mut() {
                        Some(resource) => resource,
                        None => &mut resources[0],
                    };
                    target.properties.retain(|p| p.name != property.name);
                    target.properties.push(property);
                }
                "add" => match current.as_mut() {
                    None => {
                        if rest.is_empty() {
                            return Err(err("'add' needs a kind".into()));
                        }
                        current = Some(Resource::kind(rest));
                    }
                    Some(resource) => {
                        let (name, value) = rest
                            .split_once(char::is_whitespace)
                            .ok_or_else(|| {
                                err(format!("malformed add: {rest}"))
                            })?;
                        let value = unquote(value.trim());
                        match resource
                            .properties
                            .iter_mut()
                            .find(|p| p.name == name)
                        {
                            Some(Property {
                                value: PropertyValue::List(vs), ..
                            }) => vs.push(value),
                            Some(_) => {
                                return Err(err(format!(
                                    "'{name}' is not a list property"
                                )))
                            }
                            None => resource
                                .properties
                                .push(Property::list(name, vec![value])),
                        }
                    }
                },
                other => return Err(err(format!("unknown verb '{other}'"))),
            }
        }
        if current.is_some() {
            return Err(ParseError {
                line: text.lines().count(),
                message: "unterminated resource".to_string(),
            });
        }
        Ok(Self { resources })
    }
}

fn not_found(filter: &Resource) -> ZoneError {
    ZoneError::new(
        ErrorCode::ResourceNotFound,
        format!("no matching '{}' resource", filter.kind),
    )
}

fn parse_value(value: &str) -> PropertyValue {
    match value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        Some(inner) => PropertyValue::List(
            inner
                .split(',')
                .map(|v| unquote(v.trim()))
                .filter(|v| !v.is_empty())
                .collect(),
        ),
        None => PropertyValue::Simple(unquote(value)),
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .map(|v| v.replace("\\\"", "\""))
        .unwrap_or_else(|| value.to_string())
}
