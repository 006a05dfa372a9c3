//! File editing tool with multiple operation modes. Adapted from
//! `km_tools::tools::editor_edit::EditorEditTool`: same basic
//! (search-and-replace list) and extended (anchor + operation) request
//! shapes and the same literal-text-matching semantics, rewired onto
//! [`super::Tool`].

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::ToolResultContent;

use super::{Annotations, Tool, ToolError};

#[derive(Clone)]
pub struct EditorEditTool;

impl EditorEditTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EditorEditTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct BasicEditRequest {
    file_path: String,
    edits: Vec<BasicEdit>,
}

#[derive(Debug, Deserialize)]
struct BasicEdit {
    old_text: String,
    new_text: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Debug, Deserialize)]
struct ExtendedEditRequest {
    file_path: String,
    operation: Operation,
    #[serde(default)]
    anchor: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operation {
    Replace,
    InsertBefore,
    InsertAfter,
    Delete,
    Append,
    Prepend,
}

#[async_trait]
impl Tool for EditorEditTool {
    fn name(&self) -> &str {
        "editor_edit"
    }

    fn description(&self) -> &str {
        "Edit text files via literal search-and-replace or anchor-relative insert/delete/append/prepend operations."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "Absolute path to the file to edit" },
                "edits": {
                    "type": "array",
                    "description": "List of edit operations (basic mode)",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_text": { "type": "string" },
                            "new_text": { "type": "string" },
                            "replace_all": { "type": "boolean", "default": false }
                        },
                        "required": ["old_text", "new_text"]
                    }
                },
                "operation": {
                    "type": "string",
                    "enum": ["replace", "insert_before", "insert_after", "delete", "append", "prepend"]
                },
                "anchor": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["file_path"]
        })
    }

    fn annotations(&self) -> Annotations {
        Annotations { read_only: false, destructive: true, idempotent: false, open_world: false }
    }

    async fn call(&self, input: Value) -> Result<ToolResultContent, ToolError> {
        let name = self.name().to_string();
        if let Ok(request) = serde_json::from_value::<BasicEditRequest>(input.clone()) {
            return execute_basic_edits(&request).await.map(ToolResultContent::text).map_err(|message| ToolError::CallFailed { name, message });
        }
        if let Ok(request) = serde_json::from_value::<ExtendedEditRequest>(input) {
            return execute_extended_operation(&request).await.map(ToolResultContent::text).map_err(|message| ToolError::CallFailed { name, message });
        }
        Err(ToolError::CallFailed {
            name,
            message: "invalid request: must provide either 'edits' (basic mode) or 'operation' (extended mode)".into(),
        })
    }
}

async fn execute_basic_edits(request: &BasicEditRequest) -> Result<String, String> {
    let file_path = Path::new(&request.file_path);
    let mut content = fs::read_to_string(file_path).map_err(|e| format!("Failed to read file '{}': {e}", request.file_path))?;

    let mut edits_applied = 0;
    let mut total_replacements = 0;

    for (idx, edit) in request.edits.iter().enumerate() {
        let count = content.matches(&edit.old_text).count();
        if count == 0 {
            return Err(format!("Edit #{}: old_text not found in file.\nSearching for:\n{}\n", idx + 1, edit.old_text));
        }
        if !edit.replace_all && count > 1 {
            return Err(format!(
                "Edit #{}: old_text appears {count} times (must be unique).\nSearching for:\n{}\n\nInclude more context to make it unique, or set replace_all: true.",
                idx + 1,
                edit.old_text
            ));
        }
        content = content.replace(&edit.old_text, &edit.new_text);
        edits_applied += 1;
        total_replacements += count;
    }

    fs::write(file_path, &content).map_err(|e| format!("Failed to write file '{}': {e}", request.file_path))?;
    Ok(format!("Successfully applied {edits_applied} edit(s) ({total_replacements} replacement(s)) to '{}'", request.file_path))
}

async fn execute_extended_operation(request: &ExtendedEditRequest) -> Result<String, String> {
    let file_path = Path::new(&request.file_path);

    match request.operation {
        Operation::Append => {
            let mut content = fs::read_to_string(file_path).map_err(|e| format!("Failed to read file '{}': {e}", request.file_path))?;
            content.push_str(&request.content);
            fs::write(file_path, &content).map_err(|e| format!("Failed to write file '{}': {e}", request.file_path))?;
            Ok(format!("Successfully appended {} bytes to '{}'", request.content.len(), request.file_path))
        }
        Operation::Prepend => {
            let content = fs::read_to_string(file_path).map_err(|e| format!("Failed to read file '{}': {e}", request.file_path))?;
            let new_content = format!("{}{}", request.content, content);
            fs::write(file_path, &new_content).map_err(|e| format!("Failed to write file '{}': {e}", request.file_path))?;
            Ok(format!("Successfully prepended {} bytes to '{}'", request.content.len(), request.file_path))
        }
        Operation::Replace | Operation::InsertBefore | Operation::InsertAfter | Operation::Delete => {
            if request.anchor.is_empty() {
                return Err("this operation requires an 'anchor' field".to_string());
            }
            let content = fs::read_to_string(file_path).map_err(|e| format!("Failed to read file '{}': {e}", request.file_path))?;
            let count = content.matches(&request.anchor).count();
            if count == 0 {
                return Err(format!("Anchor not found in file.\nSearching for:\n{}\n", request.anchor));
            }
            if count > 1 {
                return Err(format!(
                    "Anchor appears {count} times (must be unique).\nSearching for:\n{}\n\nInclude more context to make it unique.",
                    request.anchor
                ));
            }
            let new_content = match request.operation {
                Operation::Replace => content.replace(&request.anchor, &request.content),
                Operation::InsertBefore => content.replace(&request.anchor, &format!("{}{}", request.content, request.anchor)),
                Operation::InsertAfter => content.replace(&request.anchor, &format!("{}{}", request.anchor, request.content)),
                Operation::Delete => content.replace(&request.anchor, ""),
                _ => unreachable!(),
            };
            fs::write(file_path, &new_content).map_err(|e| format!("Failed to write file '{}': {e}", request.file_path))?;
            Ok(format!("Successfully applied operation to '{}'", request.file_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn basic_replace_rewrites_the_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "Hello, world!\n").unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let request = BasicEditRequest { file_path: path.clone(), edits: vec![BasicEdit { old_text: "world".into(), new_text: "Rust".into(), replace_all: false }] };
        execute_basic_edits(&request).await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Hello, Rust!\n");
    }

    #[tokio::test]
    async fn non_unique_anchor_without_replace_all_fails() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "test\ntest\n").unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let request = BasicEditRequest { file_path: path, edits: vec![BasicEdit { old_text: "test".into(), new_text: "replaced".into(), replace_all: false }] };
        let err = execute_basic_edits(&request).await.unwrap_err();
        assert!(err.contains("appears 2 times"));
    }

    #[tokio::test]
    async fn insert_after_places_content_right_after_anchor() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "use std::io;\n\nfn main() {{}}\n").unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let request = ExtendedEditRequest { file_path: path.clone(), operation: Operation::InsertAfter, anchor: "use std::io;\n".into(), content: "use std::fs;\n".into() };
        execute_extended_operation(&request).await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "use std::io;\nuse std::fs;\n\nfn main() {}\n");
    }

    #[tokio::test]
    async fn tool_call_routes_basic_mode_requests() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "foo\n").unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let tool = EditorEditTool::new();
        let result = tool.call(json!({"file_path": path, "edits": [{"old_text": "foo", "new_text": "bar"}]})).await.unwrap();
        match result {
            ToolResultContent::Text(t) => assert!(t.contains("Successfully applied")),
            other => panic!("expected text content, got {other:?}"),
        }
    }
}
