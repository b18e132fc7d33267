//! Route template compilation and matching.
//!
//! Templates look like `/user/{id:int}/files/{rest:path}`. Each
//! `{name:converter}` placeholder lowers to a named capture group; built-in
//! converter names map to fixed atoms and any other converter name is used
//! as a literal regex atom. Literal segments are copied verbatim.

use std::borrow::Cow;

use regex::Regex;
use tracing::trace;

/// Matches `{name:converter}` placeholders (either part may be empty here;
/// emptiness is rejected with a proper error during compilation).
const PLACEHOLDER: &str = r"\{([^}]*):([^}]*)\}";

fn converter_atom(converter: &str) -> Cow<'static, str> {
    match converter.to_ascii_lowercase().as_str() {
        "alpha" => Cow::Borrowed("[A-Za-z]+"),
        "alnum" => Cow::Borrowed("[A-Za-z0-9]+"),
        "string" => Cow::Borrowed("[^/]*"),
        "int" => Cow::Borrowed("[0-9]+"),
        "path" => Cow::Borrowed(".*"),
        "uuid" => Cow::Borrowed(
            r"\b[0-9a-f]{8}\b-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-\b[0-9a-f]{12}\b",
        ),
        // Any other converter name is itself a regex atom.
        _ => Cow::Owned(converter.to_owned()),
    }
}

/// A compiled route template.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRoute {
    pub(crate) raw: String,
    pub(crate) regex: Regex,
    /// Placeholder names, in template order.
    pub(crate) params: Vec<String>,
    /// Converter names, aligned with `params`.
    pub(crate) converters: Vec<String>,
}

/// Lowers a route template to an anchored regex.
///
/// Assumes the template has no `//` runs; callers normalize. Rejected:
/// empty parameter or converter names, duplicate parameter names, and
/// anything (placeholder or literal) following a `path` placeholder.
pub(crate) fn compile(template: &str) -> crate::Result<CompiledRoute> {
    let placeholder = Regex::new(PLACEHOLDER).expect("placeholder pattern is valid");

    let mut pattern = String::from(r"\A");
    let mut params: Vec<String> = Vec::new();
    let mut converters = Vec::new();
    let mut last_end = 0;
    let mut path_terminal = false;

    for caps in placeholder.captures_iter(template) {
        let whole = caps.get(0).expect("whole match");
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let converter = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        if path_terminal {
            return Err(crate::Error::new_user_route(RouteError::new(
                template,
                "nothing may follow a 'path' segment; use 'string' to match within one segment",
            )));
        }
        if name.is_empty() {
            return Err(crate::Error::new_user_route(RouteError::new(
                template,
                "parameter name cannot be empty",
            )));
        }
        if converter.is_empty() {
            return Err(crate::Error::new_user_route(RouteError::new(
                template,
                "parameter converter type cannot be empty",
            )));
        }
        if params.iter().any(|p| p == name) {
            return Err(crate::Error::new_user_route(RouteError::new(
                template,
                "duplicate parameter name",
            )));
        }

        pattern.push_str(&template[last_end..whole.start()]);
        pattern.push_str("(?P<");
        pattern.push_str(name);
        pattern.push('>');
        pattern.push_str(&converter_atom(converter));
        pattern.push(')');

        if converter.eq_ignore_ascii_case("path") {
            path_terminal = true;
        }
        params.push(name.to_owned());
        converters.push(converter.to_owned());
        last_end = whole.end();
    }

    let tail = &template[last_end..];
    if path_terminal && !tail.is_empty() {
        return Err(crate::Error::new_user_route(RouteError::new(
            template,
            "nothing may follow a 'path' segment; use 'string' to match within one segment",
        )));
    }
    pattern.push_str(tail);
    pattern.push_str(r"\z");

    let regex = Regex::new(&pattern)
        .map_err(|e| crate::Error::new_user_route(RouteError::new(template, &e.to_string())))?;
    trace!("compiled route {:?} to {:?}", template, pattern);

    Ok(CompiledRoute {
        raw: template.to_owned(),
        regex,
        params,
        converters,
    })
}

#[derive(Debug)]
struct RouteError {
    template: String,
    reason: String,
}

impl RouteError {
    fn new(template: &str, reason: &str) -> RouteError {
        RouteError {
            template: template.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "route {:?}: {}", self.template, self.reason)
    }
}

impl std::error::Error for RouteError {}

/// Ordered collection of compiled routes; first full match wins.
#[derive(Default)]
pub(crate) struct RouteMatcher {
    entries: Vec<MatchEntry>,
}

struct MatchEntry {
    regex: Regex,
    params: Vec<String>,
    /// Index into the application's flat endpoint list.
    endpoint: usize,
}

impl RouteMatcher {
    pub(crate) fn build<'a, I>(routes: I) -> RouteMatcher
    where
        I: IntoIterator<Item = (usize, &'a CompiledRoute)>,
    {
        RouteMatcher {
            entries: routes
                .into_iter()
                .map(|(endpoint, route)| MatchEntry {
                    regex: route.regex.clone(),
                    params: route.params.clone(),
                    endpoint,
                })
                .collect(),
        }
    }

    /// Returns the first endpoint whose pattern fully matches `path`,
    /// together with the captured arguments in placeholder order.
    pub(crate) fn get(&self, path: &str) -> Option<(usize, Vec<(String, String)>)> {
        for entry in &self.entries {
            if let Some(caps) = entry.regex.captures(path) {
                let args = entry
                    .params
                    .iter()
                    .map(|name| {
                        let value = caps
                            .name(name)
                            .map(|m| m.as_str().to_owned())
                            .unwrap_or_default();
                        (name.clone(), value)
                    })
                    .collect();
                return Some((entry.endpoint, args));
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
