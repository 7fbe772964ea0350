//! Prompt assembly for notebook code generation.

use crate::{materializer::sandbox_file_name, notebook::FileDescriptor};

/// System prompt for the code generator
pub const NOTEBOOK_SYSTEM_PROMPT: &str = r#"You are a Python data analyst working in a stateful notebook.

Environment:
- Variables persist between cells, like Jupyter.
- Attached data files are already in the sandbox at the paths listed in the request.
- Matplotlib uses the Agg backend; call plt.show() to emit a figure.
- Packages: pandas, numpy, scipy, scikit-learn, matplotlib, seaborn, openpyxl.
- Do not install packages.

Rules:
- Emit code cells only, no markdown and no backticks.
- Each cell must run on its own given the state left by earlier cells.
- Check that a file exists before loading it.
- Print every result with a short label.
- Verify column names before using them.

Structure the work as 3 to 7 cells: imports, loading, exploration,
one cell per analysis step, then an optional visualization.

Respond with {"cells": [{"content": "..."}]} or {"code": "..."} for a single block."#;

/// Reference for one attached file, structured when metadata is available
pub fn describe_file(file: &FileDescriptor, workspace_root: Option<&str>) -> String {
    let name = sandbox_file_name(&file.file_name).unwrap_or_else(|_| file.file_name.clone());
    let location = match workspace_root {
        Some(root) => format!("{}/{}", root.trim_end_matches('/'), name),
        None => format!("./{}", name),
    };

    let mut text = format!(
        "[Data file attached: {} ({})]\nPath in sandbox: {}",
        file.file_name, file.media_type, location
    );
    if let Some(metadata) = &file.metadata {
        text.push('\n');
        text.push_str(&metadata.describe());
    }
    text
}

/// User prompt: file references first, then the request itself.
pub fn build_user_prompt(
    request: &str,
    files: &[FileDescriptor],
    workspace_root: Option<&str>,
) -> String {
    if files.is_empty() {
        return request.to_string();
    }

    let references: Vec<String> = files
        .iter()
        .map(|f| describe_file(f, workspace_root))
        .collect();
    let names: Vec<String> = files.iter().map(|f| format!("'{}'", f.file_name)).collect();

    format!(
        "{}\n\n{}\n\nThe data file(s) {} are already uploaded. Complete the whole task in the generated cells.",
        references.join("\n\n"),
        request,
        names.join(", ")
    )
}
