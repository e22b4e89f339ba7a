//! The line-oriented `.csheet` worksheet text format.
//!
//! This exists so the engine can be driven end to end from the command
//! line; it is not the product's document format. One element per line:
//!
//! ```text
//! # comment
//! sheet "Projectile"
//! import ./constants.csheet
//! calc v0 = 20
//! break calc t = 2 * v0 / g
//! out console t
//! text "apex time follows"
//! ```
//!
//! `break calc` sets the instruction breakpoint on the element. Imports
//! are resolved relative to the importing file and loaded recursively;
//! a file is loaded once no matter how often it is imported.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use calcsheet_core::document::{
    Calculation, DocHandle, DocumentId, DocumentRegistry, ElementKind, Worksheet,
};
use calcsheet_core::expr;

/// Load a worksheet file (plus imports) into the registry.
pub fn load_worksheet(registry: &DocumentRegistry, path: &Path) -> Result<DocHandle> {
    let mut loaded = HashMap::new();
    let id = load_file(registry, path, &mut loaded)?;
    registry
        .handle(id)
        .context("worksheet vanished from the registry")
}

/// Re-parse `path` into the existing worksheet behind `handle`.
///
/// Used by watch mode: the document identity is preserved so the
/// engine's staleness tracking sees an edit, not a new document.
pub fn reload_worksheet(registry: &DocumentRegistry, handle: &DocHandle, path: &Path) -> Result<()> {
    let mut loaded = HashMap::new();
    // Map the root path back to its existing id so imports of the root
    // (cycles) stay stable.
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    loaded.insert(canonical, handle.id());

    let parsed = parse_file(registry, path, handle.id(), &mut loaded)?;
    let replaced = handle.with_write(|sheet| {
        // Keep the revision monotonic across the swap.
        let revision = sheet.revision;
        *sheet = parsed;
        sheet.revision = revision;
        sheet.bump_revision();
    });
    if replaced.is_none() {
        bail!("worksheet {} is no longer open", handle.id());
    }
    Ok(())
}

fn load_file(
    registry: &DocumentRegistry,
    path: &Path,
    loaded: &mut HashMap<PathBuf, DocumentId>,
) -> Result<DocumentId> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    if let Some(id) = loaded.get(&canonical) {
        return Ok(*id);
    }
    let id = registry.allocate_id();
    // Registered before parsing so import cycles terminate.
    loaded.insert(canonical, id);
    let sheet = parse_file(registry, path, id, loaded)?;
    registry.insert(sheet);
    Ok(id)
}

fn parse_file(
    registry: &DocumentRegistry,
    path: &Path,
    id: DocumentId,
    loaded: &mut HashMap<PathBuf, DocumentId>,
) -> Result<Worksheet> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let default_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "worksheet".to_string());
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut sheet = Worksheet::new(id, default_name);
    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        parse_line(registry, &mut sheet, base, line, loaded)
            .with_context(|| format!("{}:{}: {}", path.display(), line_no, raw.trim()))?;
    }
    Ok(sheet)
}

fn parse_line(
    registry: &DocumentRegistry,
    sheet: &mut Worksheet,
    base: &Path,
    line: &str,
    loaded: &mut HashMap<PathBuf, DocumentId>,
) -> Result<()> {
    if let Some(rest) = line.strip_prefix("sheet ") {
        sheet.name = unquote(rest.trim()).to_string();
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix("import ") {
        let target = base.join(unquote(rest.trim()));
        let imported = load_file(registry, &target, loaded)?;
        sheet.push(ElementKind::Import(imported));
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix("text ") {
        sheet.push(ElementKind::Text(unquote(rest.trim()).to_string()));
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix("out ") {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let device = parts.next().unwrap_or_default().to_string();
        let source = parts.next().context("expected: out <device> <expr>")?;
        let parsed = expr::parse(source).map_err(anyhow::Error::from)?;
        sheet.push(ElementKind::Output {
            device,
            expr: parsed,
        });
        return Ok(());
    }

    let (line, breakpoint) = match line.strip_prefix("break ") {
        Some(rest) => (rest.trim(), true),
        None => (line, false),
    };
    if let Some(rest) = line.strip_prefix("calc ") {
        let (target, source) = rest
            .split_once('=')
            .context("expected: calc <name> = <expr>")?;
        let target = target.trim();
        if target.is_empty() || !target.chars().all(|c| c.is_alphanumeric() || c == '_') {
            bail!("invalid identifier '{}'", target);
        }
        let parsed = expr::parse(source).map_err(anyhow::Error::from)?;
        let element = sheet.push(ElementKind::Calculation(Calculation {
            target: target.to_string(),
            expr: parsed,
        }));
        if breakpoint {
            sheet.set_breakpoint(element, true);
        }
        return Ok(());
    }

    bail!("unrecognized directive");
}

fn unquote(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_basic_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "fall.csheet",
            "# free fall\n\
             sheet \"Free Fall\"\n\
             calc g = 9.81\n\
             calc t = 2\n\
             break calc h = g * t ^ 2 / 2\n\
             out console h\n\
             text \"height after two seconds\"\n",
        );
        let registry = DocumentRegistry::new();
        let doc = load_worksheet(&registry, &path).unwrap();

        doc.with_read(|sheet| {
            assert_eq!(sheet.name, "Free Fall");
            assert_eq!(sheet.elements.len(), 5);
            assert_eq!(sheet.executable_elements().count(), 4);
            let h = &sheet.elements[2];
            assert!(h.breakpoint);
            assert!(matches!(
                sheet.elements[3].kind,
                ElementKind::Output { .. }
            ));
        })
        .unwrap();
    }

    #[test]
    fn test_imports_resolve_relative_and_once() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "constants.csheet", "calc g = 9.81\n");
        let path = write_file(
            dir.path(),
            "main.csheet",
            "import constants.csheet\n\
             import constants.csheet\n\
             calc w = g * 2\n",
        );
        let registry = DocumentRegistry::new();
        let doc = load_worksheet(&registry, &path).unwrap();

        let imports = doc.with_read(|sheet| sheet.direct_imports()).unwrap();
        assert_eq!(imports.len(), 2);
        // The same file resolves to one document.
        assert_eq!(imports[0], imports[1]);
        assert_eq!(registry.import_closure(doc.id()).len(), 1);
    }

    #[test]
    fn test_parse_error_carries_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.csheet", "calc = 1\n");
        let registry = DocumentRegistry::new();
        let err = load_worksheet(&registry, &path).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.csheet:1"));
    }

    #[test]
    fn test_reload_preserves_document_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "main.csheet", "calc x = 1\n");
        let registry = DocumentRegistry::new();
        let doc = load_worksheet(&registry, &path).unwrap();
        let before = doc.with_read(|s| (s.id, s.revision)).unwrap();

        write_file(dir.path(), "main.csheet", "calc x = 1\ncalc y = x + 1\n");
        reload_worksheet(&registry, &doc, &path).unwrap();

        doc.with_read(|sheet| {
            assert_eq!(sheet.id, before.0);
            assert!(sheet.revision > before.1);
            assert_eq!(sheet.executable_elements().count(), 2);
        })
        .unwrap();
    }
}
