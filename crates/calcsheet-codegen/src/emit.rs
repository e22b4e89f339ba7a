//! C++ emission for worksheet models.
//!
//! A worksheet is translated into a single C++ translation unit that
//! implements the runtime contract in `calcsheet_core::abi`: a model
//! control block synchronized through atomics, one checkpoint per
//! operation for pause/abort/breakpoint/run-to/single-step handling,
//! watchpoint checks on every assignment, and the exported
//! `calcsheet_model_*` entry points including the deallocator.
//!
//! Imported worksheets are inlined ahead of the root, dependencies
//! first. Their assignments populate identifier storage but are not
//! registered as operations, so breakpoints and the paused-element
//! decoration always refer to the root document.

use std::collections::HashSet;

use calcsheet_core::diag::Diagnostic;
use calcsheet_core::document::{DocumentId, DocumentRegistry, ElementId, ElementKind, Worksheet};
use calcsheet_core::expr::{BinOp, Expr, MathFn};
use calcsheet_core::symbols::{IdentifierDatabase, OperationDatabase};

/// Everything emission produces besides the source text.
pub struct EmittedModel {
    /// The generated C++ translation unit.
    pub source: String,
    pub identifiers: IdentifierDatabase,
    pub operations: OperationDatabase,
    /// Output device names, indexed by ABI device index.
    pub devices: Vec<String>,
    /// `(first source line, element)` pairs in ascending line order,
    /// used to attribute compiler diagnostics back to elements.
    pub line_map: Vec<(usize, ElementId)>,
    /// Non-fatal diagnostics collected during emission.
    pub warnings: Vec<Diagnostic>,
}

/// Translate `root` (plus its transitive imports) into C++.
///
/// `on_step` is invoked after each translated element; returning `false`
/// abandons the translation. Errors (undefined identifiers, missing
/// imports) fail the translation and are returned as diagnostics.
pub fn emit_model(
    registry: &DocumentRegistry,
    root: &Worksheet,
    mut on_step: impl FnMut(u64) -> bool,
) -> Result<Option<EmittedModel>, Vec<Diagnostic>> {
    let mut emitter = Emitter::new();
    let mut errors = Vec::new();

    // Inline imports depth-first so definitions precede their uses.
    let mut visited = HashSet::new();
    visited.insert(root.id);
    let mut imported = Vec::new();
    for el in &root.elements {
        if let ElementKind::Import(import) = el.kind {
            collect_imports(registry, import, &mut visited, &mut imported, &mut errors, el.id);
        }
    }

    // First pass: identifiers and operations, plus reference checks.
    for sheet in &imported {
        for el in sheet.executable_elements() {
            emitter.scan_element(el, None, &mut errors);
        }
    }
    for el in root.executable_elements() {
        emitter.scan_element(el, Some(el.id), &mut errors);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Second pass: the translation unit itself.
    emitter.prologue();
    emitter.begin_run();
    let mut completed = 0u64;
    for sheet in &imported {
        for el in sheet.executable_elements() {
            emitter.emit_element(el, false);
            completed += 1;
            if !on_step(completed) {
                return Ok(None);
            }
        }
    }
    for el in root.executable_elements() {
        emitter.emit_element(el, true);
        completed += 1;
        if !on_step(completed) {
            return Ok(None);
        }
    }
    emitter.end_run();
    emitter.epilogue();

    Ok(Some(emitter.finish()))
}

/// Number of steps [`emit_model`] will report for this root.
pub fn step_count(registry: &DocumentRegistry, root: &Worksheet) -> u64 {
    let mut visited = HashSet::new();
    visited.insert(root.id);
    let mut imported = Vec::new();
    let mut errors = Vec::new();
    for el in &root.elements {
        if let ElementKind::Import(import) = el.kind {
            collect_imports(registry, import, &mut visited, &mut imported, &mut errors, el.id);
        }
    }
    let inherited: u64 = imported
        .iter()
        .map(|s| s.executable_elements().count() as u64)
        .sum();
    inherited + root.executable_elements().count() as u64
}

fn collect_imports(
    registry: &DocumentRegistry,
    id: DocumentId,
    visited: &mut HashSet<DocumentId>,
    out: &mut Vec<Worksheet>,
    errors: &mut Vec<Diagnostic>,
    import_element: ElementId,
) {
    if !visited.insert(id) {
        return;
    }
    let Some(handle) = registry.handle(id) else {
        errors.push(Diagnostic::translation_error(
            format!("imported worksheet {} does not exist", id),
            Some(import_element),
        ));
        return;
    };
    let Some(sheet) = handle.with_read(|s| s.clone()) else {
        errors.push(Diagnostic::translation_error(
            format!("imported worksheet {} was closed", id),
            Some(import_element),
        ));
        return;
    };
    for el in &sheet.elements {
        if let ElementKind::Import(nested) = el.kind {
            collect_imports(registry, nested, visited, out, errors, el.id);
        }
    }
    out.push(sheet);
}

struct Emitter {
    out: String,
    line: usize,
    identifiers: IdentifierDatabase,
    operations: OperationDatabase,
    devices: Vec<String>,
    line_map: Vec<(usize, ElementId)>,
    warnings: Vec<Diagnostic>,
    referenced: HashSet<String>,
}

impl Emitter {
    fn new() -> Self {
        Self {
            out: String::new(),
            line: 1,
            identifiers: IdentifierDatabase::new(),
            operations: OperationDatabase::new(),
            devices: Vec::new(),
            line_map: Vec::new(),
            warnings: Vec::new(),
            referenced: HashSet::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
        self.line += 1;
    }

    /// Register symbols for one element and check its references.
    fn scan_element(
        &mut self,
        el: &calcsheet_core::document::Element,
        root_op: Option<ElementId>,
        errors: &mut Vec<Diagnostic>,
    ) {
        match &el.kind {
            ElementKind::Calculation(calc) => {
                self.check_references(&calc.expr, el.id, errors);
                self.identifiers.register(&calc.target, Some(el.id));
            }
            ElementKind::Output { device, expr } => {
                self.check_references(expr, el.id, errors);
                if !self.devices.contains(device) {
                    self.devices.push(device.clone());
                }
            }
            _ => return,
        }
        if let Some(element) = root_op {
            self.operations.register(element);
        }
    }

    fn check_references(&mut self, expr: &Expr, element: ElementId, errors: &mut Vec<Diagnostic>) {
        for name in expr.identifiers() {
            if self.identifiers.by_name(&name).is_none() {
                errors.push(Diagnostic::translation_error(
                    format!("identifier '{}' is not defined before use", name),
                    Some(element),
                ));
            }
            self.referenced.insert(name);
        }
    }

    fn prologue(&mut self) {
        let n_idents = self.identifiers.len().max(1);
        let n_ops = self.operations.len().max(1);
        self.push("// Generated by calcsheet-codegen. Do not edit.");
        self.push("#include <atomic>");
        self.push("#include <chrono>");
        self.push("#include <cmath>");
        self.push("#include <cstdint>");
        self.push("#include <new>");
        self.push("#include <thread>");
        self.push("");
        self.push("namespace {");
        self.push("");
        self.push("typedef void (*calcsheet_host_cb)(void*, int32_t, int32_t, int32_t, int32_t, double);");
        self.push("");
        self.push("constexpr int32_t EV_STARTED = 1;");
        self.push("constexpr int32_t EV_FINISHED = 2;");
        self.push("constexpr int32_t EV_ABORTED = 3;");
        self.push("constexpr int32_t EV_PAUSED_ON_USER_REQUEST = 4;");
        self.push("constexpr int32_t EV_PAUSED_AT_OPERATION = 5;");
        self.push("constexpr int32_t EV_PAUSED_ON_VARIABLE_UPDATE = 6;");
        self.push("constexpr int32_t EV_RESUMED = 7;");
        self.push("constexpr int32_t EV_OUTPUT = 8;");
        self.push("");
        self.push("constexpr int32_t REASON_USER = 0;");
        self.push("constexpr int32_t REASON_INVALID_NUMERIC = 3;");
        self.push("");
        self.push(&format!("constexpr int32_t N_IDENTIFIERS = {};", n_idents));
        self.push(&format!("constexpr int32_t N_OPERATIONS = {};", n_ops));
        self.push("");
        self.push("struct Model {");
        self.push("    calcsheet_host_cb cb;");
        self.push("    void* user;");
        self.push("    std::atomic<int32_t> pause_requested;");
        self.push("    std::atomic<int32_t> resume_requested;");
        self.push("    std::atomic<int32_t> abort_requested;");
        self.push("    std::atomic<int32_t> abort_reported;");
        self.push("    std::atomic<int32_t> single_step;");
        self.push("    std::atomic<int32_t> run_to;");
        self.push("    std::atomic<int32_t> paused;");
        self.push("    std::atomic<int32_t> breakpoints[N_OPERATIONS];");
        self.push("    std::atomic<int32_t> watches[N_IDENTIFIERS];");
        self.push("    std::atomic<double> values[N_IDENTIFIERS];");
        self.push("};");
        self.push("");
        self.push("// Parks the run thread until resumed or aborted.");
        self.push("bool wait_while_paused(Model* m, int32_t op) {");
        self.push("    m->paused.store(1);");
        self.push("    for (;;) {");
        self.push("        if (m->abort_requested.load()) { m->paused.store(0); return false; }");
        self.push("        if (m->resume_requested.exchange(0)) break;");
        self.push("        std::this_thread::sleep_for(std::chrono::milliseconds(1));");
        self.push("    }");
        self.push("    m->paused.store(0);");
        self.push("    m->cb(m->user, EV_RESUMED, op, -1, -1, 0.0);");
        self.push("    return true;");
        self.push("}");
        self.push("");
        self.push("// Safe point before each operation. Returns false to abort.");
        self.push("bool checkpoint(Model* m, int32_t op) {");
        self.push("    if (m->abort_requested.load()) return false;");
        self.push("    int32_t run_to = m->run_to.load();");
        self.push("    bool hit = m->breakpoints[op].load() != 0 || run_to == op;");
        self.push("    if (run_to == op) m->run_to.store(-1);");
        self.push("    if (hit || m->single_step.exchange(0)) {");
        self.push("        m->cb(m->user, EV_PAUSED_AT_OPERATION, op, -1, -1, 0.0);");
        self.push("        return wait_while_paused(m, op);");
        self.push("    }");
        self.push("    if (m->pause_requested.exchange(0)) {");
        self.push("        m->cb(m->user, EV_PAUSED_ON_USER_REQUEST, op, -1, -1, 0.0);");
        self.push("        return wait_while_paused(m, op);");
        self.push("    }");
        self.push("    return true;");
        self.push("}");
        self.push("");
        self.push("bool assign(Model* m, int32_t op, int32_t ident, double value) {");
        self.push("    if (!std::isfinite(value)) {");
        self.push("        m->abort_reported.store(1);");
        self.push("        m->cb(m->user, EV_ABORTED, op, -1, REASON_INVALID_NUMERIC, 0.0);");
        self.push("        return false;");
        self.push("    }");
        self.push("    m->values[ident].store(value);");
        self.push("    if (m->watches[ident].load()) {");
        self.push("        m->cb(m->user, EV_PAUSED_ON_VARIABLE_UPDATE, op, ident, -1, value);");
        self.push("        return wait_while_paused(m, op);");
        self.push("    }");
        self.push("    return true;");
        self.push("}");
        self.push("");
        self.push("bool emit_output(Model* m, int32_t op, int32_t device, double value) {");
        self.push("    if (!std::isfinite(value)) {");
        self.push("        m->abort_reported.store(1);");
        self.push("        m->cb(m->user, EV_ABORTED, op, -1, REASON_INVALID_NUMERIC, 0.0);");
        self.push("        return false;");
        self.push("    }");
        self.push("    m->cb(m->user, EV_OUTPUT, op, device, -1, value);");
        self.push("    return true;");
        self.push("}");
        self.push("");
        self.push("} // namespace");
        self.push("");
    }

    fn begin_run(&mut self) {
        self.push("extern \"C\" int32_t calcsheet_model_run(void* handle, int32_t debug) {");
        self.push("    Model* m = static_cast<Model*>(handle);");
        self.push("    m->cb(m->user, EV_STARTED, -1, -1, -1, 0.0);");
        self.push("    bool ok = true;");
    }

    fn emit_element(&mut self, el: &calcsheet_core::document::Element, instrumented: bool) {
        match &el.kind {
            ElementKind::Calculation(calc) => {
                let ident = self
                    .identifiers
                    .by_name(&calc.target)
                    .map(|e| e.handle.0)
                    .unwrap_or(-1);
                let (op, op_comment) = if instrumented {
                    let op = self.operations.by_element(el.id).map(|o| o.0).unwrap_or(-1);
                    (op, format!("op {}", op))
                } else {
                    (-1, "imported".to_string())
                };
                self.line_map_entry(el.id, instrumented);
                self.push(&format!(
                    "    // {}: {} := ...",
                    op_comment, calc.target
                ));
                if instrumented {
                    self.push(&format!(
                        "    ok = ok && (debug == 0 || checkpoint(m, {}));",
                        op
                    ));
                }
                self.push(&format!(
                    "    ok = ok && assign(m, {}, {}, {});",
                    op,
                    ident,
                    compile_expr(&calc.expr, &self.identifiers)
                ));
            }
            ElementKind::Output { device, expr } => {
                let device_index = self
                    .devices
                    .iter()
                    .position(|d| d == device)
                    .map(|i| i as i32)
                    .unwrap_or(-1);
                let op = if instrumented {
                    self.operations.by_element(el.id).map(|o| o.0).unwrap_or(-1)
                } else {
                    -1
                };
                self.line_map_entry(el.id, instrumented);
                self.push(&format!("    // output to '{}'", device));
                if instrumented {
                    self.push(&format!(
                        "    ok = ok && (debug == 0 || checkpoint(m, {}));",
                        op
                    ));
                }
                self.push(&format!(
                    "    ok = ok && emit_output(m, {}, {}, {});",
                    op,
                    device_index,
                    compile_expr(expr, &self.identifiers)
                ));
            }
            _ => {}
        }
    }

    fn line_map_entry(&mut self, element: ElementId, instrumented: bool) {
        if instrumented {
            self.line_map.push((self.line, element));
        }
    }

    fn end_run(&mut self) {
        self.push("    if (ok) {");
        self.push("        m->cb(m->user, EV_FINISHED, -1, -1, -1, 0.0);");
        self.push("        return 0;");
        self.push("    }");
        self.push("    if (!m->abort_reported.exchange(1)) {");
        self.push("        m->cb(m->user, EV_ABORTED, -1, -1, REASON_USER, 0.0);");
        self.push("    }");
        self.push("    return 1;");
        self.push("}");
        self.push("");
    }

    fn epilogue(&mut self) {
        self.push("extern \"C\" void* calcsheet_model_create(calcsheet_host_cb cb, void* user) {");
        self.push("    Model* m = new (std::nothrow) Model();");
        self.push("    if (!m) return nullptr;");
        self.push("    m->cb = cb;");
        self.push("    m->user = user;");
        self.push("    m->pause_requested.store(0);");
        self.push("    m->resume_requested.store(0);");
        self.push("    m->abort_requested.store(0);");
        self.push("    m->abort_reported.store(0);");
        self.push("    m->single_step.store(0);");
        self.push("    m->run_to.store(-1);");
        self.push("    m->paused.store(0);");
        self.push("    for (int32_t i = 0; i < N_OPERATIONS; ++i) m->breakpoints[i].store(0);");
        self.push("    for (int32_t i = 0; i < N_IDENTIFIERS; ++i) {");
        self.push("        m->watches[i].store(0);");
        self.push("        m->values[i].store(0.0);");
        self.push("    }");
        self.push("    return m;");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_destroy(void* handle) {");
        self.push("    delete static_cast<Model*>(handle);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_request_pause(void* handle) {");
        self.push("    static_cast<Model*>(handle)->pause_requested.store(1);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_request_resume(void* handle) {");
        self.push("    static_cast<Model*>(handle)->resume_requested.store(1);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_request_abort(void* handle) {");
        self.push("    static_cast<Model*>(handle)->abort_requested.store(1);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" int32_t calcsheet_model_set_breakpoint(void* handle, int32_t op, int32_t set) {");
        self.push("    if (op < 0 || op >= N_OPERATIONS) return 0;");
        self.push("    static_cast<Model*>(handle)->breakpoints[op].store(set ? 1 : 0);");
        self.push("    return 1;");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_set_run_to(void* handle, int32_t op) {");
        self.push("    static_cast<Model*>(handle)->run_to.store(op);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" void calcsheet_model_set_single_step(void* handle, int32_t on) {");
        self.push("    static_cast<Model*>(handle)->single_step.store(on ? 1 : 0);");
        self.push("}");
        self.push("");
        self.push("extern \"C\" int32_t calcsheet_model_set_watch(void* handle, int32_t ident, int32_t set) {");
        self.push("    if (ident < 0 || ident >= N_IDENTIFIERS) return 0;");
        self.push("    static_cast<Model*>(handle)->watches[ident].store(set ? 1 : 0);");
        self.push("    return 1;");
        self.push("}");
        self.push("");
        self.push("extern \"C\" int32_t calcsheet_model_update_identifier(void* handle, int32_t ident, double value) {");
        self.push("    Model* m = static_cast<Model*>(handle);");
        self.push("    if (ident < 0 || ident >= N_IDENTIFIERS) return 0;");
        self.push("    if (!m->paused.load()) return 0;");
        self.push("    m->values[ident].store(value);");
        self.push("    return 1;");
        self.push("}");
        self.push("");
        self.push("extern \"C\" int32_t calcsheet_model_read_identifier(void* handle, int32_t ident, double* out) {");
        self.push("    Model* m = static_cast<Model*>(handle);");
        self.push("    if (ident < 0 || ident >= N_IDENTIFIERS) return 0;");
        self.push("    *out = m->values[ident].load();");
        self.push("    return 1;");
        self.push("}");
    }

    fn finish(mut self) -> EmittedModel {
        // Identifiers defined in the root but never read deserve a note.
        for entry in self.identifiers.entries() {
            if entry.defined_by.is_some() && !self.referenced.contains(&entry.name) {
                self.warnings.push(Diagnostic::translation_warning(
                    format!("identifier '{}' is never used", entry.name),
                    entry.defined_by,
                ));
            }
        }
        EmittedModel {
            source: self.out,
            identifiers: self.identifiers,
            operations: self.operations,
            devices: self.devices,
            line_map: self.line_map,
            warnings: self.warnings,
        }
    }
}

/// Compile an expression to a C++ double expression over the model's
/// identifier storage.
fn compile_expr(expr: &Expr, identifiers: &IdentifierDatabase) -> String {
    match expr {
        Expr::Number(n) => format!("{:?}", n),
        Expr::Ident(name) => {
            let index = identifiers.by_name(name).map(|e| e.handle.0).unwrap_or(0);
            format!("m->values[{}].load()", index)
        }
        Expr::Neg(inner) => format!("(-{})", compile_expr(inner, identifiers)),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = compile_expr(lhs, identifiers);
            let rhs = compile_expr(rhs, identifiers);
            match op {
                BinOp::Add => format!("({} + {})", lhs, rhs),
                BinOp::Sub => format!("({} - {})", lhs, rhs),
                BinOp::Mul => format!("({} * {})", lhs, rhs),
                BinOp::Div => format!("({} / {})", lhs, rhs),
                BinOp::Pow => format!("std::pow({}, {})", lhs, rhs),
            }
        }
        Expr::Call { func, arg } => {
            let arg = compile_expr(arg, identifiers);
            let name = match func {
                MathFn::Sqrt => "std::sqrt",
                MathFn::Sin => "std::sin",
                MathFn::Cos => "std::cos",
                MathFn::Ln => "std::log",
                MathFn::Exp => "std::exp",
                MathFn::Abs => "std::fabs",
            };
            format!("{}({})", name, arg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcsheet_core::document::Calculation;
    use calcsheet_core::expr;

    fn registry_with(
        registry: &DocumentRegistry,
        calcs: &[(&str, &str)],
    ) -> Worksheet {
        let id = registry.allocate_id();
        let mut sheet = Worksheet::new(id, "test");
        for (target, src) in calcs {
            sheet.push(ElementKind::Calculation(Calculation {
                target: target.to_string(),
                expr: expr::parse(src).unwrap(),
            }));
        }
        sheet
    }

    #[test]
    fn test_emitted_source_has_all_exports() {
        let registry = DocumentRegistry::new();
        let mut sheet = registry_with(&registry, &[("x", "1"), ("y", "x * 2")]);
        sheet.push(ElementKind::Output {
            device: "console".to_string(),
            expr: expr::parse("y").unwrap(),
        });

        let emitted = emit_model(&registry, &sheet, |_| true).unwrap().unwrap();
        for symbol in [
            "calcsheet_model_create",
            "calcsheet_model_destroy",
            "calcsheet_model_run",
            "calcsheet_model_request_pause",
            "calcsheet_model_request_resume",
            "calcsheet_model_request_abort",
            "calcsheet_model_set_breakpoint",
            "calcsheet_model_set_run_to",
            "calcsheet_model_set_single_step",
            "calcsheet_model_set_watch",
            "calcsheet_model_update_identifier",
            "calcsheet_model_read_identifier",
        ] {
            assert!(
                emitted.source.contains(symbol),
                "missing export {}",
                symbol
            );
        }
        assert!(emitted.source.contains("constexpr int32_t N_IDENTIFIERS = 2;"));
        assert_eq!(emitted.devices, vec!["console".to_string()]);
    }

    #[test]
    fn test_one_checkpoint_per_operation() {
        let registry = DocumentRegistry::new();
        let sheet = registry_with(&registry, &[("a", "1"), ("b", "2"), ("c", "a + b")]);
        let emitted = emit_model(&registry, &sheet, |_| true).unwrap().unwrap();
        let checkpoints = emitted.source.matches("checkpoint(m, ").count();
        assert_eq!(checkpoints, emitted.operations.len());
        assert_eq!(emitted.operations.len(), 3);
        assert_eq!(emitted.line_map.len(), 3);
    }

    #[test]
    fn test_undefined_identifier_is_an_error() {
        let registry = DocumentRegistry::new();
        let sheet = registry_with(&registry, &[("x", "missing + 1")]);
        let errors = emit_model(&registry, &sheet, |_| true).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("missing"));
        assert!(errors[0].element.is_some());
    }

    #[test]
    fn test_unused_identifier_is_a_warning() {
        let registry = DocumentRegistry::new();
        let sheet = registry_with(&registry, &[("x", "1"), ("y", "x + 1")]);
        let emitted = emit_model(&registry, &sheet, |_| true).unwrap().unwrap();
        // y is assigned but never read.
        assert_eq!(emitted.warnings.len(), 1);
        assert!(emitted.warnings[0].message.contains("'y'"));
    }

    #[test]
    fn test_imports_are_inlined_without_operations() {
        let registry = DocumentRegistry::new();
        let library = registry_with(&registry, &[("g", "9.81")]);
        let library_id = library.id;
        registry.insert(library);

        let root_id = registry.allocate_id();
        let mut root = Worksheet::new(root_id, "main");
        root.push(ElementKind::Import(library_id));
        root.push(ElementKind::Calculation(Calculation {
            target: "w".to_string(),
            expr: expr::parse("g * 2").unwrap(),
        }));

        let emitted = emit_model(&registry, &root, |_| true).unwrap().unwrap();
        // g is known to the identifier table but not an operation.
        assert!(emitted.identifiers.by_name("g").is_some());
        assert_eq!(emitted.operations.len(), 1);
        assert_eq!(step_count(&registry, &root), 2);
    }

    #[test]
    fn test_missing_import_is_an_error() {
        let registry = DocumentRegistry::new();
        let ghost = registry.allocate_id();
        let root_id = registry.allocate_id();
        let mut root = Worksheet::new(root_id, "main");
        root.push(ElementKind::Import(ghost));
        let errors = emit_model(&registry, &root, |_| true).unwrap_err();
        assert!(errors[0].message.contains("does not exist"));
    }

    #[test]
    fn test_cancelled_emission_returns_none() {
        let registry = DocumentRegistry::new();
        let sheet = registry_with(&registry, &[("a", "1"), ("b", "2")]);
        let result = emit_model(&registry, &sheet, |done| done < 2).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_expression_compilation() {
        let mut identifiers = IdentifierDatabase::new();
        identifiers.register("x", None);
        let compiled = compile_expr(&expr::parse("sqrt(x ^ 2 + 1)").unwrap(), &identifiers);
        assert_eq!(
            compiled,
            "std::sqrt((std::pow(m->values[0].load(), 2.0) + 1.0))"
        );
    }
}
