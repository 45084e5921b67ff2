//! Minimal NEXUS support: the TREES block, with an optional Translate table.

use crate::newick;
use crate::tree::Tree;
use crate::TreeError;
use hashbrown::HashMap;

/// Extract and parse the first tree of the TREES block.
pub fn parse(text: &str) -> Result<Tree, TreeError> {
    let lower = text.to_ascii_lowercase();
    let trees_at = lower.find("begin trees").ok_or(TreeError::NoNexusTree)?;
    let block = &text[trees_at..];
    let block_lower = &lower[trees_at..];

    let translate = match block_lower.find("translate") {
        Some(at) => {
            let rest = &block[at + "translate".len()..];
            let end = rest.find(';').ok_or(TreeError::NoNexusTree)?;
            parse_translate(&rest[..end])
        }
        None => HashMap::new(),
    };

    let tree_at = find_tree_statement(block_lower).ok_or(TreeError::NoNexusTree)?;
    let rest = &block[tree_at..];
    let eq = rest.find('=').ok_or(TreeError::NoNexusTree)?;
    let end = rest.find(';').ok_or(TreeError::NoNexusTree)?;
    if end < eq {
        return Err(TreeError::NoNexusTree);
    }
    let mut newick_text = rest[eq + 1..end].trim().to_string();
    newick_text.push(';');

    let tree = newick::parse(&newick_text)?;
    if translate.is_empty() {
        return Ok(tree);
    }
    apply_translate(tree, &translate)
}

fn find_tree_statement(block_lower: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(at) = block_lower[from..].find("tree ") {
        let abs = from + at;
        // Must start a statement, not be the tail of e.g. "subtree".
        let starts_clean = abs == 0
            || block_lower.as_bytes()[abs - 1].is_ascii_whitespace()
            || block_lower.as_bytes()[abs - 1] == b';';
        if starts_clean {
            return Some(abs);
        }
        from = abs + 1;
    }
    None
}

fn parse_translate(body: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for entry in body.split(',') {
        let mut it = entry.split_whitespace();
        if let (Some(key), Some(name)) = (it.next(), it.next()) {
            table.insert(key.to_string(), name.trim_matches('\'').to_string());
        }
    }
    table
}

fn apply_translate(tree: Tree, table: &HashMap<String, String>) -> Result<Tree, TreeError> {
    // Rebuild with translated leaf labels; arena order is preserved.
    let n = tree.node_count();
    let mut parents = vec![None; n];
    let mut lengths = vec![0.0; n];
    let mut labels = vec![None; n];
    for i in 0..n {
        let id = crate::NodeId(i);
        parents[i] = tree.parent(id).map(|p| p.0);
        lengths[i] = tree.length(id);
        labels[i] = tree.label(id).map(|l| match table.get(l) {
            Some(name) => name.clone(),
            None => l.to_string(),
        });
    }
    Tree::from_parts(parents, lengths, labels)
}

/// Serialize a tree as a single-tree NEXUS document.
pub fn write(tree: &Tree, name: &str) -> String {
    format!(
        "#NEXUS\nbegin trees;\n    tree {} = {}\nend;\n",
        name,
        newick::write(tree)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_trees_block() {
        let text = "#NEXUS\nbegin trees;\n  tree one = ((a:1.0,b:1.0):1.0,c:2.0);\nend;\n";
        let t = parse(text).unwrap();
        assert_eq!(t.num_leaves(), 3);
    }

    #[test]
    fn parses_translate_table() {
        let text = concat!(
            "#NEXUS\nbegin trees;\n  translate\n    1 alpha,\n    2 beta,\n    3 gamma;\n",
            "  tree t1 = ((1:1.0,2:1.0):1.0,3:2.0);\nend;\n"
        );
        let t = parse(text).unwrap();
        assert!(t.leaf_id("alpha").is_some());
        assert!(t.leaf_id("gamma").is_some());
        assert!(t.leaf_id("1").is_none());
    }

    #[test]
    fn strips_rooting_comment() {
        let text = "#NEXUS\nbegin trees;\n tree t = [&R] ((a:1.0,b:1.0):1.0,c:2.0);\nend;\n";
        let t = parse(text).unwrap();
        assert_eq!(t.num_leaves(), 3);
    }

    #[test]
    fn missing_block_is_an_error() {
        assert!(matches!(
            parse("#NEXUS\nbegin taxa;\nend;"),
            Err(TreeError::NoNexusTree)
        ));
    }

    #[test]
    fn writer_emits_trees_block() {
        let t = newick::parse("((a:1.0,b:1.0):1.0,c:2.0);").unwrap();
        let out = write(&t, "augmented");
        assert!(out.starts_with("#NEXUS"));
        assert!(out.contains("tree augmented = (("));
        assert!(parse(&out).is_ok());
    }
}
