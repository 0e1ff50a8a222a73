use crate::error::{ProtocolError, Result};
use std::collections::BTreeMap;

/// Parameters whose value partitions rate-limit buckets that would otherwise
/// collide under one template. First present wins, in this order.
pub const MAJOR_PARAMS: [&str; 3] = ["guild_id", "channel_id", "webhook_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub const fn lower(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

/// A REST endpoint: verb plus a path template with `%{name}` placeholders.
///
/// Equality and hashing use the unformatted template, so two routes for
/// different ids collapse into one value only when every parameter matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    template: &'static str,
    params: BTreeMap<String, String>,
}

impl Route {
    pub fn new(method: Method, template: &'static str) -> Self {
        Self {
            method,
            template,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub const fn method(&self) -> Method {
        self.method
    }

    pub const fn template(&self) -> &'static str {
        self.template
    }

    /// The template with every `%{name}` placeholder substituted.
    pub fn formatted_path(&self) -> Result<String> {
        let mut path = String::with_capacity(self.template.len() + 16);
        let mut rest = self.template;

        while let Some(start) = rest.find("%{") {
            path.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                ProtocolError::InvalidTemplate(self.template.to_owned())
            })?;
            let name = &after[..end];
            let value = self
                .params
                .get(name)
                .ok_or_else(|| ProtocolError::MissingParam(name.to_owned()))?;
            path.push_str(value);
            rest = &after[end + 1..];
        }

        if rest.contains('}') {
            return Err(ProtocolError::InvalidTemplate(self.template.to_owned()).into());
        }
        path.push_str(rest);
        Ok(path)
    }

    /// Value of the first major parameter present, if any.
    pub fn major_param(&self) -> Option<&str> {
        MAJOR_PARAMS
            .iter()
            .find_map(|name| self.params.get(*name))
            .map(String::as_str)
    }

    /// The string that groups requests whose quota the server shares:
    /// `"<verb>:<template>:<major_or_empty>"`, template verbatim.
    pub fn rate_limit_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.method.lower(),
            self.template,
            self.major_param().unwrap_or("")
        )
    }
}
