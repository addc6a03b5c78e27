//! Code Analyzer
//!
//! Parses Rust source into a tree-sitter syntax tree, enumerates
//! function definitions, and computes cyclomatic complexity per
//! function as `1 + count(control-flow nodes)`. Counted nodes:
//! conditionals (`if`, `if let`), loops (`while`, `while let`, `for`,
//! `loop`), match arms, short-circuit booleans (`&&`, `||`) and
//! assert-family macros. The analyzer only ever reads and parses; it
//! never executes analyzed code.

use anyhow::{anyhow, Context, Result};
use tree_sitter::{Node, Parser, Tree};

use crate::types::FunctionComplexity;

/// Functions above this complexity are flagged for improvement.
pub const COMPLEXITY_FLAG_THRESHOLD: u32 = 10;

const BRANCH_KINDS: &[&str] = &[
    "if_expression",
    "if_let_expression",
    "while_expression",
    "while_let_expression",
    "for_expression",
    "loop_expression",
    "match_arm",
];

const ASSERT_MACROS: &[&str] = &[
    "assert",
    "assert_eq",
    "assert_ne",
    "debug_assert",
    "debug_assert_eq",
    "debug_assert_ne",
];

fn rust_parser() -> Result<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_rust::language())
        .context("failed to load Rust grammar")?;
    Ok(parser)
}

/// Parse source text into a syntax tree.
pub fn parse_source(source: &str) -> Result<Tree> {
    rust_parser()?
        .parse(source, None)
        .ok_or_else(|| anyhow!("parser produced no tree"))
}

/// True when the tree contains syntax errors.
pub fn has_parse_errors(source: &str) -> Result<bool> {
    Ok(parse_source(source)?.root_node().has_error())
}

/// Enumerate every function definition with its cyclomatic complexity.
pub fn function_complexities(source: &str) -> Result<Vec<FunctionComplexity>> {
    let tree = parse_source(source)?;
    let bytes = source.as_bytes();
    let mut functions = Vec::new();
    collect_functions(tree.root_node(), bytes, &mut functions);
    Ok(functions)
}

/// Count `pub fn` items in the source, at any nesting level.
pub fn count_public_functions(source: &str) -> Result<usize> {
    let tree = parse_source(source)?;
    let bytes = source.as_bytes();
    let mut count = 0;
    count_public(tree.root_node(), bytes, &mut count);
    Ok(count)
}

/// True when the source defines a function with the given name.
pub fn has_function(source: &str, name: &str) -> Result<bool> {
    Ok(function_complexities(source)?.iter().any(|f| f.name == name))
}

fn collect_functions(node: Node<'_>, source: &[u8], out: &mut Vec<FunctionComplexity>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "function_item" {
            let name = child
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(source).ok())
                .unwrap_or("<anonymous>")
                .to_string();
            let complexity = match child.child_by_field_name("body") {
                Some(body) => 1 + count_control_flow(body, source),
                None => 1,
            };
            out.push(FunctionComplexity {
                name,
                complexity,
                line: child.start_position().row + 1,
            });
        }
        collect_functions(child, source, out);
    }
}

fn count_public(node: Node<'_>, source: &[u8], out: &mut usize) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "function_item" {
            let mut inner = child.walk();
            let is_public = child
                .children(&mut inner)
                .any(|c| c.kind() == "visibility_modifier");
            if is_public {
                *out += 1;
            }
        }
        count_public(child, source, out);
    }
}

/// Count control-flow nodes below `node`, not descending into nested
/// function items (those carry their own complexity).
fn count_control_flow(node: Node<'_>, source: &[u8]) -> u32 {
    let mut count = 0;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "function_item" {
            continue;
        }
        if is_control_flow(&child, source) {
            count += 1;
        }
        count += count_control_flow(child, source);
    }
    count
}

fn is_control_flow(node: &Node<'_>, source: &[u8]) -> bool {
    let kind = node.kind();
    if BRANCH_KINDS.contains(&kind) {
        return true;
    }
    // Short-circuit operators appear as anonymous operator tokens.
    if kind == "&&" || kind == "||" {
        return true;
    }
    if kind == "macro_invocation" {
        if let Some(name) = node
            .child_by_field_name("macro")
            .and_then(|m| m.utf8_text(source).ok())
        {
            return ASSERT_MACROS.contains(&name);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_function_has_complexity_one() {
        let source = "fn plain() -> i32 { let x = 1; x + 2 }";
        let functions = function_complexities(source).unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name, "plain");
        assert_eq!(functions[0].complexity, 1);
    }

    #[test]
    fn test_k_ifs_give_one_plus_k() {
        // Three sequential ifs and no other control flow.
        let source = r#"
            fn branchy(a: i32) -> i32 {
                let mut total = 0;
                if a > 0 { total += 1; }
                if a > 10 { total += 2; }
                if a > 100 { total += 3; }
                total
            }
        "#;
        let functions = function_complexities(source).unwrap();
        assert_eq!(functions[0].complexity, 1 + 3);
    }

    #[test]
    fn test_loops_matches_and_short_circuits_count() {
        let source = r#"
            fn busy(items: &[i32]) -> i32 {
                let mut total = 0;
                for item in items {            // +1
                    match item {               // arms: +2
                        0 => total -= 1,
                        _ => total += item,
                    }
                }
                while total > 100 && total < 200 { // +1 while, +1 &&
                    total /= 2;
                }
                total
            }
        "#;
        let functions = function_complexities(source).unwrap();
        assert_eq!(functions[0].complexity, 1 + 5);
    }

    #[test]
    fn test_assert_macros_count() {
        let source = r#"
            fn checked(x: i32) {
                assert!(x > 0);
                assert_eq!(x % 2, 0);
            }
        "#;
        let functions = function_complexities(source).unwrap();
        assert_eq!(functions[0].complexity, 1 + 2);
    }

    #[test]
    fn test_nested_functions_counted_separately() {
        let source = r#"
            fn outer(x: i32) -> i32 {
                fn inner(y: i32) -> i32 {
                    if y > 0 { y } else { -y }
                }
                inner(x)
            }
        "#;
        let functions = function_complexities(source).unwrap();
        assert_eq!(functions.len(), 2);
        let outer = functions.iter().find(|f| f.name == "outer").unwrap();
        let inner = functions.iter().find(|f| f.name == "inner").unwrap();
        assert_eq!(outer.complexity, 1);
        assert_eq!(inner.complexity, 2);
    }

    #[test]
    fn test_count_public_functions() {
        let source = r#"
            pub fn a() {}
            fn b() {}
            pub(crate) fn c() {}
            mod inner {
                pub fn d() {}
            }
        "#;
        assert_eq!(count_public_functions(source).unwrap(), 3);
    }

    #[test]
    fn test_has_function() {
        let source = "fn execute(input: &str) -> String { input.to_string() }";
        assert!(has_function(source, "execute").unwrap());
        assert!(!has_function(source, "main").unwrap());
    }

    #[test]
    fn test_parse_error_detection() {
        assert!(!has_parse_errors("fn fine() {}").unwrap());
        assert!(has_parse_errors("fn broken( {").unwrap());
    }
}
