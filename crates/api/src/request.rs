//! Declarative request descriptors.

use reqwest::Method;
use serde_json::{Map, Value};

use crate::Error;

/// A file posted as `multipart/form-data`, plus its text fields.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub fields: Vec<(String, String)>,
    pub file_field: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

impl MultipartBody {
    pub fn new(file_field: impl Into<String>, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            fields: Vec::new(),
            file_field: file_field.into(),
            file_name: file_name.into(),
            data,
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((name.into(), value.to_string()));
        self
    }

    /// Builds a fresh form; forms are consumed by sending, so every attempt
    /// gets its own.
    pub(crate) fn to_form(&self) -> Result<reqwest::multipart::Form, Error> {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        let part = reqwest::multipart::Part::bytes(self.data.clone())
            .file_name(self.file_name.clone())
            .mime_str("application/octet-stream")?;
        Ok(form.part(self.file_field.clone(), part))
    }
}

/// One typed request parameter.
#[derive(Debug, Clone)]
pub enum Param {
    Query(Vec<(String, String)>),
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(MultipartBody),
}

/// Body of an assembled request.
#[derive(Debug, Clone)]
pub(crate) enum PreparedBody {
    /// Serialised once, replayed on every attempt.
    Json(Vec<u8>),
    Form(Vec<(String, String)>),
    Multipart(MultipartBody),
}

/// Parameters merged by kind and validated.
#[derive(Debug, Clone, Default)]
pub(crate) struct Prepared {
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<PreparedBody>,
}

/// Merges parameters by variant.
///
/// Query lists and form lists concatenate, JSON objects merge keys (later
/// wins). At most one body kind may be present, and at most one multipart.
pub(crate) fn assemble(params: &[Param]) -> Result<Prepared, Error> {
    let mut query = Vec::new();
    let mut json: Option<Map<String, Value>> = None;
    let mut form: Option<Vec<(String, String)>> = None;
    let mut multipart: Option<MultipartBody> = None;

    for param in params {
        match param {
            Param::Query(pairs) => query.extend(pairs.iter().cloned()),
            Param::Json(Value::Object(map)) => {
                let merged = json.get_or_insert_with(Map::new);
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Param::Json(other) => {
                return Err(Error::Request(format!(
                    "JSON body must be an object, got {other}"
                )));
            }
            Param::Form(pairs) => form.get_or_insert_with(Vec::new).extend(pairs.iter().cloned()),
            Param::Multipart(body) => {
                if multipart.is_some() {
                    return Err(Error::Request("more than one multipart body".into()));
                }
                multipart = Some(body.clone());
            }
        }
    }

    let kinds = usize::from(json.is_some()) + usize::from(form.is_some()) + usize::from(multipart.is_some());
    if kinds > 1 {
        return Err(Error::Request(
            "conflicting body parameters: use one of json, form or multipart".into(),
        ));
    }

    let body = if let Some(map) = json {
        Some(PreparedBody::Json(serde_json::to_vec(&Value::Object(map))?))
    } else if let Some(pairs) = form {
        Some(PreparedBody::Form(pairs))
    } else {
        multipart.map(PreparedBody::Multipart)
    };

    Ok(Prepared { query, body })
}

/// A request to the API, built by tasks and dispatched by a session.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path under the server root, or an absolute URL.
    pub path: String,
    /// Overrides the client's API version header.
    pub version: Option<String>,
    pub params: Vec<Param>,
    /// Sent without a bearer token.
    pub unauthenticated: bool,
    /// Extra codes retryable for this call only.
    pub retry_codes: Vec<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            version: None,
            params: Vec::new(),
            unauthenticated: false,
            retry_codes: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn query<K, V, I>(self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        self.param(Param::Query(pairs))
    }

    #[must_use]
    pub fn json(self, body: Value) -> Self {
        self.param(Param::Json(body))
    }

    #[must_use]
    pub fn form<K, V, I>(self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        self.param(Param::Form(pairs))
    }

    #[must_use]
    pub fn multipart(self, body: MultipartBody) -> Self {
        self.param(Param::Multipart(body))
    }

    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.unauthenticated = true;
        self
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn retry_on<S: AsRef<str>>(mut self, codes: &[S]) -> Self {
        self.retry_codes
            .extend(codes.iter().map(|c| c.as_ref().to_string()));
        self
    }

    /// Label used in logs.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn queries_concatenate() {
        let req = ApiRequest::get("/rest/folders")
            .query([("limit", 10)])
            .query([("offset", 20)]);
        let prepared = assemble(&req.params).unwrap();
        assert_eq!(
            prepared.query,
            vec![
                ("limit".to_string(), "10".to_string()),
                ("offset".to_string(), "20".to_string())
            ]
        );
        assert!(prepared.body.is_none());
    }

    #[test]
    fn json_objects_merge_later_wins() {
        let req = ApiRequest::post("/rest/folders/1/folders")
            .json(json!({"name": "a", "description": "x"}))
            .json(json!({"name": "b"}));
        let prepared = assemble(&req.params).unwrap();
        let Some(PreparedBody::Json(bytes)) = prepared.body else {
            panic!("expected JSON body");
        };
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"name": "b", "description": "x"}));
    }

    #[test]
    fn forms_concatenate() {
        let req = ApiRequest::post("/oauth/token")
            .form([("grant_type", "password")])
            .form([("username", "alice")]);
        let prepared = assemble(&req.params).unwrap();
        let Some(PreparedBody::Form(pairs)) = prepared.body else {
            panic!("expected form body");
        };
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn query_composes_with_any_body() {
        let req = ApiRequest::post("/rest/uploads/9")
            .query([("returnEntity", "true")])
            .multipart(MultipartBody::new("content", "f.bin", vec![1, 2, 3]));
        let prepared = assemble(&req.params).unwrap();
        assert_eq!(prepared.query.len(), 1);
        assert!(matches!(prepared.body, Some(PreparedBody::Multipart(_))));
    }

    #[test]
    fn conflicting_bodies_are_rejected() {
        let req = ApiRequest::post("/x")
            .json(json!({"a": 1}))
            .form([("b", "2")]);
        assert!(matches!(assemble(&req.params), Err(Error::Request(_))));

        let req = ApiRequest::post("/x")
            .form([("b", "2")])
            .multipart(MultipartBody::new("content", "f", Vec::new()));
        assert!(matches!(assemble(&req.params), Err(Error::Request(_))));
    }

    #[test]
    fn two_multiparts_are_rejected() {
        let part = MultipartBody::new("content", "f", Vec::new());
        let req = ApiRequest::post("/x")
            .multipart(part.clone())
            .multipart(part);
        assert!(matches!(assemble(&req.params), Err(Error::Request(_))));
    }

    #[test]
    fn non_object_json_is_rejected() {
        let req = ApiRequest::post("/x").json(json!([1, 2]));
        assert!(matches!(assemble(&req.params), Err(Error::Request(_))));
    }

    #[test]
    fn builder_flags() {
        let req = ApiRequest::delete("/rest/files/1")
            .unauthenticated()
            .version("27")
            .retry_on(&["ERR_ENTITY_LOCKED"]);
        assert!(req.unauthenticated);
        assert_eq!(req.version.as_deref(), Some("27"));
        assert_eq!(req.retry_codes, vec!["ERR_ENTITY_LOCKED".to_string()]);
        assert_eq!(req.label(), "DELETE /rest/files/1");
    }
}
