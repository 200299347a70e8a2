//! `${NAME}` / `$NAME` expansion for freestyle steps.
//!
//! Lookup order is parameters, then job environment, then built-ins.
//! Names that resolve nowhere are left exactly as written.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static VARIABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|e| panic!("variable pattern: {e}"))
});

/// Layered variable scopes used for expansion.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    pub parameters: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub builtins: BTreeMap<String, String>,
}

impl VariableScope {
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .or_else(|| self.environment.get(name))
            .or_else(|| self.builtins.get(name))
            .map(String::as_str)
    }

    /// Expand every known token in `input`.
    pub fn expand(&self, input: &str) -> String {
        VARIABLE_REGEX
            .replace_all(input, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.lookup(name) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Environment handed to step processes: built-ins < environment < parameters.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut env = self.builtins.clone();
        env.extend(self.environment.clone());
        env.extend(self.parameters.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> VariableScope {
        let mut s = VariableScope::default();
        s.parameters.insert("TARGET".into(), "prod".into());
        s.environment.insert("TARGET".into(), "staging".into());
        s.environment.insert("REGION".into(), "eu".into());
        s.builtins.insert("BUILD_NUMBER".into(), "42".into());
        s.builtins.insert("REGION".into(), "us".into());
        s
    }

    #[test]
    fn test_both_token_forms() {
        let s = scope();
        assert_eq!(s.expand("deploy ${TARGET} #$BUILD_NUMBER"), "deploy prod #42");
    }

    #[test]
    fn test_precedence_parameters_env_builtins() {
        let s = scope();
        assert_eq!(s.expand("$TARGET"), "prod");
        assert_eq!(s.expand("$REGION"), "eu");
    }

    #[test]
    fn test_unresolved_tokens_left_verbatim() {
        let s = scope();
        assert_eq!(s.expand("echo $HOME ${MISSING} $"), "echo $HOME ${MISSING} $");
    }

    #[test]
    fn test_adjacent_text() {
        let s = scope();
        assert_eq!(s.expand("${BUILD_NUMBER}x"), "42x");
        // `$BUILD_NUMBERx` names a different variable.
        assert_eq!(s.expand("$BUILD_NUMBERx"), "$BUILD_NUMBERx");
    }

    #[test]
    fn test_process_env_parameters_win() {
        let env = scope().process_env();
        assert_eq!(env["TARGET"], "prod");
        assert_eq!(env["REGION"], "eu");
        assert_eq!(env["BUILD_NUMBER"], "42");
    }
}
