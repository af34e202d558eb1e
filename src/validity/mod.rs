//! The file validity gate: a tree-sitter syntactic check plus
//! per-language semantic checks, run against a file inside an execution
//! environment before an edit is accepted.
//!
//! The gate short-circuits on the first negative result:
//!
//! 1. parse into a CST for the language inferred from the extension
//!    (unknown extensions pass with a warning),
//! 2. report syntax-error regions with ±5 lines of context,
//! 3. reject blank files,
//! 4. language-specific checks: Go import rules plus the
//!    build-constraint-aware compile gate, Vue embedded-script re-parse,
//!    Python empty-body detection.

mod languages;

pub use languages::Language;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser, Tree};

use crate::buildtags::check_go_compile;
use crate::exec::ExecEnvironment;

/// Lines of context included around each syntax-error region.
const ERROR_CONTEXT_LINES: usize = 5;

/// Verdict for one file. `valid = true` may still carry a warning
/// message (e.g. unknown extension).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileValidity {
    pub valid: bool,
    pub message: String,
}

impl FileValidity {
    fn ok() -> Self {
        Self {
            valid: true,
            message: String::new(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

/// Check one file. Hard failures (unreadable file, parser init) are
/// errors; everything else is a verdict.
pub async fn check_file_validity(
    env: &ExecEnvironment,
    relative_path: &str,
) -> anyhow::Result<FileValidity> {
    let path = env.working_directory().join(relative_path);
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    let extension = std::path::Path::new(relative_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let Some(language) = Language::from_extension(extension) else {
        return Ok(FileValidity::warn(format!(
            "unrecognized file extension '{extension}', skipping validity check"
        )));
    };

    if language == Language::Vue {
        return Ok(check_vue(&source)?);
    }

    let tree = parse(language, &source)?;
    if let Some(message) = syntax_errors(&tree, &source, 0) {
        return Ok(FileValidity::invalid(message));
    }

    if source.trim().is_empty() {
        return Ok(FileValidity::invalid("File is blank"));
    }

    match language {
        Language::Go => {
            if let Some(message) = go_import_issue(&tree, &source) {
                return Ok(FileValidity::invalid(message));
            }
            if let Some(message) = check_go_compile(env, relative_path).await? {
                return Ok(FileValidity::invalid(message));
            }
            Ok(FileValidity::ok())
        }
        Language::Python => {
            let problems = python_empty_bodies(&tree, &source);
            if problems.is_empty() {
                Ok(FileValidity::ok())
            } else {
                Ok(FileValidity::invalid(problems.join("\n")))
            }
        }
        _ => Ok(FileValidity::ok()),
    }
}

fn parse(language: Language, source: &str) -> anyhow::Result<Tree> {
    let grammar = language
        .grammar()
        .with_context(|| format!("no grammar for {language:?}"))?;
    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .with_context(|| format!("loading {language:?} grammar"))?;
    parser
        .parse(source, None)
        .with_context(|| format!("parsing as {language:?}"))
}

/// Collect every error region under the root, formatted with context.
/// `line_offset` shifts reported line numbers (used for embedded Vue
/// scripts).
fn syntax_errors(tree: &Tree, source: &str, line_offset: usize) -> Option<String> {
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }

    let mut regions = Vec::new();
    collect_error_nodes(root, &mut regions);

    let lines: Vec<&str> = source.lines().collect();
    let mut sections = Vec::new();
    for node in &regions {
        let start = node.start_position().row;
        let end = node.end_position().row;
        let from = start.saturating_sub(ERROR_CONTEXT_LINES);
        let to = (end + ERROR_CONTEXT_LINES).min(lines.len().saturating_sub(1));
        let mut section = format!(
            "error near line {}:\n",
            start + 1 + line_offset
        );
        for (i, line) in lines.iter().enumerate().take(to + 1).skip(from) {
            section.push_str(&format!("{:>5} | {}\n", i + 1 + line_offset, line));
        }
        sections.push(section);
    }

    Some(format!("Syntax error(s): \n{}", sections.join("\n")))
}

fn collect_error_nodes<'a>(node: Node<'a>, out: &mut Vec<Node<'a>>) {
    if node.is_error() || node.is_missing() {
        out.push(node);
        return;
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_error_nodes(child, out);
    }
}

/// Go files get exactly one top-level import declaration, except cgo
/// files, where `import "C"` legitimately stands apart.
fn go_import_issue(tree: &Tree, source: &str) -> Option<String> {
    let root = tree.root_node();
    let mut cursor = root.walk();
    let imports: Vec<Node> = root
        .children(&mut cursor)
        .filter(|n| n.kind() == "import_declaration")
        .collect();

    if imports.len() <= 1 {
        return None;
    }
    if imports.len() == 2 {
        let is_cgo = |n: &Node| {
            n.utf8_text(source.as_bytes())
                .map(|t| t.contains("\"C\""))
                .unwrap_or(false)
        };
        if imports.iter().any(is_cgo) {
            return None;
        }
    }
    Some("Multiple import statements found".to_string())
}

/// tree-sitter doesn't flag a def/class with no body as a parse error,
/// so hunt for them explicitly.
fn python_empty_bodies(tree: &Tree, source: &str) -> Vec<String> {
    let mut problems = Vec::new();
    walk_python(tree.root_node(), source, &mut problems);
    problems
}

fn walk_python(node: Node, source: &str, out: &mut Vec<String>) {
    let kind = node.kind();
    if kind == "function_definition" || kind == "class_definition" {
        let body = node.child_by_field_name("body");
        let empty = match body {
            None => true,
            Some(body) => body.is_missing() || body.named_child_count() == 0,
        };
        if empty {
            let what = if kind == "class_definition" {
                "class"
            } else {
                "function"
            };
            out.push(format!(
                "Empty {} body found on line {}",
                what,
                node.start_position().row + 1
            ));
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_python(child, source, out);
    }
}

/// Vue single-file components: extract the `<script>` (or
/// `<script lang=ts>`) region and validate its CST; everything outside
/// the script block is out of scope for the gate.
fn check_vue(source: &str) -> anyhow::Result<FileValidity> {
    let Some(script) = extract_vue_script(source) else {
        if source.trim().is_empty() {
            return Ok(FileValidity::invalid("File is blank"));
        }
        // Template-only components have nothing for us to check.
        return Ok(FileValidity::ok());
    };

    let language = if script.is_typescript {
        Language::Typescript
    } else {
        Language::Javascript
    };
    let tree = parse(language, &script.content)?;
    if let Some(message) = syntax_errors(&tree, &script.content, script.start_line) {
        return Ok(FileValidity::invalid(message));
    }
    Ok(FileValidity::ok())
}

struct VueScript {
    content: String,
    /// 0-based line of the script content's first line in the .vue file.
    start_line: usize,
    is_typescript: bool,
}

fn extract_vue_script(source: &str) -> Option<VueScript> {
    let open_at = source.find("<script")?;
    let after_tag = &source[open_at..];
    let tag_end = after_tag.find('>')?;
    let attrs = &after_tag[..tag_end];
    let body_start = open_at + tag_end + 1;
    let body_len = source[body_start..].find("</script>")?;
    let content = source[body_start..body_start + body_len].to_string();
    let start_line = source[..body_start].lines().count();
    let is_typescript = attrs.contains("lang=\"ts\"")
        || attrs.contains("lang='ts'")
        || attrs.contains("lang=ts");
    Some(VueScript {
        content,
        start_line,
        is_typescript,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(language: Language, source: &str) -> Option<String> {
        let tree = parse(language, source).unwrap();
        syntax_errors(&tree, source, 0)
    }

    #[test]
    fn clean_sources_have_no_error_regions() {
        assert_eq!(check(Language::Go, "package p\n\nfunc main() {}\n"), None);
        assert_eq!(check(Language::Python, "def f():\n    return 1\n"), None);
        assert_eq!(check(Language::Javascript, "const x = 1;\n"), None);
        assert_eq!(check(Language::Java, "class A { int x = 1; }\n"), None);
    }

    #[test]
    fn syntax_errors_include_line_context() {
        let source = "package p\n\nfunc main() {\n    x := \n}\n";
        let message = check(Language::Go, source).unwrap();
        assert!(message.starts_with("Syntax error(s): "));
        assert!(message.contains("x :="));
        assert!(message.contains("error near line"));
    }

    #[test]
    fn go_multiple_imports_flagged() {
        let source = "package p\n\nimport \"fmt\"\nimport \"os\"\n\nfunc main() { fmt.Println(os.Args) }\n";
        let tree = parse(Language::Go, source).unwrap();
        assert_eq!(
            go_import_issue(&tree, source),
            Some("Multiple import statements found".to_string())
        );
    }

    #[test]
    fn go_cgo_import_is_exempt() {
        let source = "package p\n\n// #include <stdio.h>\nimport \"C\"\nimport \"fmt\"\n\nfunc main() { fmt.Println(C.int(0)) }\n";
        let tree = parse(Language::Go, source).unwrap();
        assert_eq!(go_import_issue(&tree, source), None);
    }

    #[test]
    fn go_three_imports_not_exempt() {
        let source =
            "package p\n\nimport \"C\"\nimport \"fmt\"\nimport \"os\"\n\nfunc main() {}\n";
        let tree = parse(Language::Go, source).unwrap();
        assert!(go_import_issue(&tree, source).is_some());
    }

    #[test]
    fn go_grouped_import_is_fine() {
        let source = "package p\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\nfunc main() { fmt.Println(os.Args) }\n";
        let tree = parse(Language::Go, source).unwrap();
        assert_eq!(go_import_issue(&tree, source), None);
    }

    #[test]
    fn python_empty_class_body_reported_with_line() {
        let source = "class C:\n";
        let tree = parse(Language::Python, source).unwrap();
        let problems = python_empty_bodies(&tree, source);
        assert_eq!(problems, vec!["Empty class body found on line 1"]);
    }

    #[test]
    fn python_empty_function_body_reported() {
        let source = "x = 1\n\ndef broken():\n";
        let tree = parse(Language::Python, source).unwrap();
        let problems = python_empty_bodies(&tree, source);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("Empty function body found on line 3"));
    }

    #[test]
    fn python_pass_body_is_fine() {
        let source = "class C:\n    pass\n\ndef f():\n    ...\n";
        let tree = parse(Language::Python, source).unwrap();
        assert!(python_empty_bodies(&tree, source).is_empty());
    }

    #[test]
    fn vue_script_extraction() {
        let source = "<template>\n  <div/>\n</template>\n<script lang=\"ts\">\nconst x: number = 1\n</script>\n";
        let script = extract_vue_script(source).unwrap();
        assert!(script.is_typescript);
        assert!(script.content.contains("const x: number = 1"));
        assert_eq!(script.start_line, 4);
    }

    #[test]
    fn vue_valid_and_invalid_scripts() {
        let good = "<script>\nconst x = 1\n</script>\n";
        assert!(check_vue(good).unwrap().valid);

        let bad = "<script lang=\"ts\">\nconst x: = \n</script>\n";
        let verdict = check_vue(bad).unwrap();
        assert!(!verdict.valid);
        assert!(verdict.message.starts_with("Syntax error(s): "));

        let template_only = "<template><div/></template>\n";
        assert!(check_vue(template_only).unwrap().valid);
    }

    #[tokio::test]
    async fn unknown_extension_passes_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.xyz"), "whatever").unwrap();
        let env = ExecEnvironment::local(dir.path()).unwrap();
        let verdict = check_file_validity(&env, "notes.xyz").await.unwrap();
        assert!(verdict.valid);
        assert!(verdict.message.contains("unrecognized"));
    }

    #[tokio::test]
    async fn blank_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.py"), "   \n\n").unwrap();
        let env = ExecEnvironment::local(dir.path()).unwrap();
        let verdict = check_file_validity(&env, "empty.py").await.unwrap();
        assert_eq!(verdict, FileValidity::invalid("File is blank"));
    }

    #[tokio::test]
    async fn verdicts_are_idempotent_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.py"), "class C:\n").unwrap();
        let env = ExecEnvironment::local(dir.path()).unwrap();
        let first = check_file_validity(&env, "c.py").await.unwrap();
        let second = check_file_validity(&env, "c.py").await.unwrap();
        assert_eq!(first, second);
        assert!(!first.valid);
    }
}
