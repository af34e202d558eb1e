//! File-extension to grammar mapping.

/// Languages the validity gate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Go,
    Python,
    Typescript,
    Tsx,
    Javascript,
    Jsx,
    Vue,
    Java,
    Kotlin,
    Markdown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "go" => Language::Go,
            "py" => Language::Python,
            "ts" => Language::Typescript,
            "tsx" => Language::Tsx,
            "js" | "mjs" | "cjs" => Language::Javascript,
            "jsx" => Language::Jsx,
            "vue" => Language::Vue,
            "java" => Language::Java,
            "kt" => Language::Kotlin,
            "md" => Language::Markdown,
            _ => return None,
        })
    }

    /// The tree-sitter grammar, where one applies directly. Vue has no
    /// grammar of its own; its script block is re-parsed as TS/JS.
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        Some(match self {
            Language::Go => tree_sitter_go::LANGUAGE.into(),
            Language::Python => tree_sitter_python::LANGUAGE.into(),
            Language::Typescript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            // The javascript grammar covers JSX syntax as well.
            Language::Javascript | Language::Jsx => tree_sitter_javascript::LANGUAGE.into(),
            Language::Java => tree_sitter_java::LANGUAGE.into(),
            Language::Kotlin => tree_sitter_kotlin_ng::LANGUAGE.into(),
            Language::Markdown => tree_sitter_md::LANGUAGE.into(),
            Language::Vue => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("go", Some(Language::Go))]
    #[case("py", Some(Language::Python))]
    #[case("ts", Some(Language::Typescript))]
    #[case("tsx", Some(Language::Tsx))]
    #[case("js", Some(Language::Javascript))]
    #[case("mjs", Some(Language::Javascript))]
    #[case("cjs", Some(Language::Javascript))]
    #[case("jsx", Some(Language::Jsx))]
    #[case("vue", Some(Language::Vue))]
    #[case("java", Some(Language::Java))]
    #[case("kt", Some(Language::Kotlin))]
    #[case("md", Some(Language::Markdown))]
    #[case("rs", None)]
    #[case("", None)]
    fn extension_mapping(#[case] ext: &str, #[case] expected: Option<Language>) {
        assert_eq!(Language::from_extension(ext), expected);
    }

    #[test]
    fn every_non_vue_language_has_a_grammar() {
        for lang in [
            Language::Go,
            Language::Python,
            Language::Typescript,
            Language::Tsx,
            Language::Javascript,
            Language::Jsx,
            Language::Java,
            Language::Kotlin,
            Language::Markdown,
        ] {
            assert!(lang.grammar().is_some(), "{lang:?} should have a grammar");
        }
        assert!(Language::Vue.grammar().is_none());
    }
}
