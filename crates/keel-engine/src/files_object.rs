//! `files` template object
//!
//! ```jinja2
//! data:
//!   nginx.conf: {{ files.get("config/nginx.conf") | b64encode }}
//! {% for f in files.glob("scripts/*.sh") %}
//!   {{ f.name }}: {{ f.content | quote }}
//! {% endfor %}
//! ```

use std::sync::Arc;

use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind};

use keel_core::Files;

/// Chart-scoped file access exposed to templates
#[derive(Debug)]
pub struct FilesObject {
    files: Files,
}

impl FilesObject {
    pub fn new(files: Files) -> Self {
        Self { files }
    }

    /// Wrap as a template value
    pub fn into_value(self) -> Value {
        Value::from_object(self)
    }
}

fn access_error(err: keel_core::CoreError) -> Error {
    Error::new(ErrorKind::InvalidOperation, err.to_string())
}

fn path_arg(args: &[Value], method: &str) -> Result<String, Error> {
    args.first()
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("files.{}() requires a path string argument", method),
            )
        })
}

impl Object for FilesObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "get" => {
                let path = path_arg(args, method)?;
                self.files.get(&path).map(Value::from).map_err(access_error)
            }
            "get_bytes" => {
                let path = path_arg(args, method)?;
                self.files
                    .get_bytes(&path)
                    .map(Value::from)
                    .map_err(access_error)
            }
            "exists" => {
                let path = path_arg(args, method)?;
                Ok(Value::from(self.files.exists(&path)))
            }
            "glob" => {
                let pattern = path_arg(args, method)?;
                let entries = self.files.glob(&pattern).map_err(access_error)?;
                Ok(Value::from_serialize(&entries))
            }
            "lines" => {
                let path = path_arg(args, method)?;
                self.files.lines(&path).map(Value::from).map_err(access_error)
            }
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!(
                    "files object has no method '{}'. Available methods: get, get_bytes, exists, glob, lines",
                    method
                ),
            )),
        }
    }
}
