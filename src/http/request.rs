use serde_json::Value;
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Sorted query-string map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryValues(BTreeMap<String, String>);

impl QueryValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: ToString,
    {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn insert_opt<K, V>(&mut self, key: K, value: Option<V>)
    where
        K: Into<String>,
        V: ToString,
    {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Form-urlencoded query string, `None` when no pairs were added.
    pub fn encoded(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.0 {
            serializer.append_pair(key, value);
        }
        Some(serializer.finish())
    }
}

/// One file in a multipart upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn content_type(mut self, mime: impl Into<String>) -> Self {
        self.content_type = Some(mime.into());
        self
    }
}

/// Multipart form: numbered file parts plus an optional `payload_json` side
/// payload. Files keep their insertion order; part keys are the index.
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    pub files: Vec<FileUpload>,
    pub payload_json: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    None,
    Json(Value),
    Multipart(MultipartBody),
}

/// Per-request options for the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: QueryValues,
    pub body: Body,
    pub reason: Option<String>,
    pub raw: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn query(mut self, query: QueryValues) -> Self {
        self.query = query;
        self
    }

    /// Append one upload; parts are numbered in insertion order.
    pub fn file(mut self, file: FileUpload) -> Self {
        match &mut self.body {
            Body::Multipart(mp) => mp.files.push(file),
            _ => {
                self.body = Body::Multipart(MultipartBody {
                    files: vec![file],
                    payload_json: None,
                });
            }
        }
        self
    }

    /// A named-file mapping becomes sequentially numbered parts.
    pub fn files<I>(self, files: I) -> Self
    where
        I: IntoIterator<Item = FileUpload>,
    {
        files.into_iter().fold(self, Self::file)
    }

    /// JSON side payload carried in the `payload_json` multipart field.
    pub fn payload_json(mut self, value: Value) -> Self {
        match &mut self.body {
            Body::Multipart(mp) => mp.payload_json = Some(value),
            _ => {
                self.body = Body::Multipart(MultipartBody {
                    files: Vec::new(),
                    payload_json: Some(value),
                });
            }
        }
        self
    }

    /// Audit-log reason, forwarded as the `X-Audit-Log-Reason` header.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Return the response body as raw bytes without JSON decoding.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}
