// external.rs — Normalization of the external block
//
// The external block is a small meta-language (a JSON subset with optional
// quotes) describing the program's environment: sample rate, block size,
// and the declared input/output/property arrays. The parser keeps it as a
// raw value tree; this pass normalizes the tree into typed declarations
// with stable 0-based indices.
//
// Preconditions: `block` is the parsed external block.
// Postconditions: returns declarations plus all accumulated diagnostics;
//   a best-effort declaration set is returned even on error.
// Failure modes: missing or malformed fields produce `E08xx` diagnostics.
// Side effects: none.

use crate::ast::{ExternalBlock, MetaValue, Span};
use crate::diag::{codes, Diagnostic};
use crate::registry::{Rate, ScalarType};

// ── Normalized declarations ─────────────────────────────────────────────────

/// One declared external input or output port. Ports are always `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDecl {
    pub name: String,
    pub width: u32,
    pub span: Span,
}

/// One declared property.
///
/// The declared scalar type is recorded for the backend, but properties are
/// `f64` semantically in this version — see `semantic_scalar`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDecl {
    pub name: String,
    pub declared: ScalarType,
    pub rate: Rate,
    pub span: Span,
}

impl PropertyDecl {
    /// The scalar type the property carries inside the graph.
    pub fn semantic_scalar(&self) -> ScalarType {
        ScalarType::F64
    }
}

/// The normalized external block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalDecl {
    pub sr: u64,
    pub block_size: u64,
    pub inputs: Vec<PortDecl>,
    pub outputs: Vec<PortDecl>,
    pub properties: Vec<PropertyDecl>,
}

/// Result of normalization.
#[derive(Debug)]
pub struct ExternalResult {
    pub external: ExternalDecl,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Normalization ───────────────────────────────────────────────────────────

/// Normalize a parsed external block into typed declarations.
pub fn normalize(block: &ExternalBlock) -> ExternalResult {
    let mut ctx = Ctx {
        diagnostics: Vec::new(),
    };

    let MetaValue::Object(fields, span) = &block.root else {
        // The grammar only produces objects here.
        ctx.error(codes::EXTERNAL_BAD_BLOCK, block.span, "external block must be an object");
        return ExternalResult {
            external: empty_external(),
            diagnostics: ctx.diagnostics,
        };
    };

    let mut sr = None;
    let mut block_size = None;
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut properties = Vec::new();

    for (key, value) in fields {
        match key.name.as_str() {
            "sr" => sr = ctx.positive_int(value, "sr"),
            "block_size" => block_size = ctx.positive_int(value, "block_size"),
            "inputs" => inputs = ctx.ports(value, "inputs"),
            "outputs" => outputs = ctx.ports(value, "outputs"),
            "properties" => properties = ctx.properties(value),
            other => ctx.error(
                codes::EXTERNAL_BAD_FIELD,
                key.span,
                format!("unknown external field '{other}'"),
            ),
        }
    }

    if sr.is_none() {
        ctx.error(codes::EXTERNAL_BAD_BLOCK, *span, "external block is missing 'sr'");
    }
    if block_size.is_none() {
        ctx.error(
            codes::EXTERNAL_BAD_BLOCK,
            *span,
            "external block is missing 'block_size'",
        );
    }

    ctx.check_duplicate_names(&inputs, &outputs, &properties);

    ExternalResult {
        external: ExternalDecl {
            sr: sr.unwrap_or(0),
            block_size: block_size.unwrap_or(0),
            inputs,
            outputs,
            properties,
        },
        diagnostics: ctx.diagnostics,
    }
}

fn empty_external() -> ExternalDecl {
    ExternalDecl {
        sr: 0,
        block_size: 0,
        inputs: Vec::new(),
        outputs: Vec::new(),
        properties: Vec::new(),
    }
}

struct Ctx {
    diagnostics: Vec<Diagnostic>,
}

impl Ctx {
    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    fn positive_int(&mut self, value: &MetaValue, field: &str) -> Option<u64> {
        match value {
            MetaValue::Int(v, _) if *v > 0 => Some(*v as u64),
            other => {
                self.error(
                    codes::EXTERNAL_BAD_FIELD,
                    other.span(),
                    format!("'{field}' must be a positive integer"),
                );
                None
            }
        }
    }

    fn ports(&mut self, value: &MetaValue, field: &str) -> Vec<PortDecl> {
        let MetaValue::Array(items, _) = value else {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                format!("'{field}' must be an array"),
            );
            return Vec::new();
        };

        let mut ports = Vec::new();
        for item in items {
            if let Some(port) = self.port(item, field) {
                ports.push(port);
            }
        }
        ports
    }

    fn port(&mut self, value: &MetaValue, field: &str) -> Option<PortDecl> {
        let MetaValue::Object(entries, span) = value else {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                format!("each entry of '{field}' must be an object"),
            );
            return None;
        };

        let mut name = None;
        let mut width = None;
        for (key, entry) in entries {
            match key.name.as_str() {
                "name" => match entry {
                    MetaValue::Word(word, _) => name = Some(word.clone()),
                    other => self.error(
                        codes::EXTERNAL_BAD_FIELD,
                        other.span(),
                        "'name' must be an identifier",
                    ),
                },
                "width" => match entry {
                    MetaValue::Int(v, _) if *v >= 1 && *v <= u32::MAX as i128 => {
                        width = Some(*v as u32)
                    }
                    other => self.error(
                        codes::EXTERNAL_BAD_FIELD,
                        other.span(),
                        "'width' must be a positive integer",
                    ),
                },
                other => self.error(
                    codes::EXTERNAL_BAD_FIELD,
                    key.span,
                    format!("unknown port field '{other}'"),
                ),
            }
        }

        match (name, width) {
            (Some(name), Some(width)) => Some(PortDecl {
                name,
                width,
                span: *span,
            }),
            _ => {
                self.error(
                    codes::EXTERNAL_BAD_FIELD,
                    *span,
                    format!("each entry of '{field}' needs 'name' and 'width'"),
                );
                None
            }
        }
    }

    fn properties(&mut self, value: &MetaValue) -> Vec<PropertyDecl> {
        let MetaValue::Array(items, _) = value else {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                "'properties' must be an array",
            );
            return Vec::new();
        };

        let mut props = Vec::new();
        for item in items {
            if let Some(prop) = self.property(item) {
                props.push(prop);
            }
        }
        props
    }

    fn property(&mut self, value: &MetaValue) -> Option<PropertyDecl> {
        let MetaValue::Object(entries, span) = value else {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                "each property must be an object",
            );
            return None;
        };

        let mut name = None;
        let mut declared = None;
        let mut rate = None;
        for (key, entry) in entries {
            match key.name.as_str() {
                "name" => match entry {
                    MetaValue::Word(word, _) => name = Some(word.clone()),
                    other => self.error(
                        codes::EXTERNAL_BAD_FIELD,
                        other.span(),
                        "'name' must be an identifier",
                    ),
                },
                "type" => declared = self.property_type(entry),
                "rate" => rate = self.property_rate(entry),
                other => self.error(
                    codes::EXTERNAL_BAD_FIELD,
                    key.span,
                    format!("unknown property field '{other}'"),
                ),
            }
        }

        let name = match name {
            Some(name) => name,
            None => {
                self.error(codes::EXTERNAL_BAD_FIELD, *span, "property needs a 'name'");
                return None;
            }
        };
        Some(PropertyDecl {
            name,
            declared: declared.unwrap_or(ScalarType::F64),
            // Property rate defaults to block.
            rate: rate.unwrap_or(Rate::Block),
            span: *span,
        })
    }

    fn property_type(&mut self, value: &MetaValue) -> Option<ScalarType> {
        let scalar = match value {
            MetaValue::Word(word, _) => match word.as_str() {
                "f32" => Some(ScalarType::F32),
                "f64" => Some(ScalarType::F64),
                "i32" => Some(ScalarType::I32),
                "i64" => Some(ScalarType::I64),
                _ => None,
            },
            _ => None,
        };
        if scalar.is_none() {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                "property 'type' must be one of f32, f64, i32, i64",
            );
        }
        scalar
    }

    fn property_rate(&mut self, value: &MetaValue) -> Option<Rate> {
        let rate = match value {
            MetaValue::Word(word, _) => match word.as_str() {
                "s" => Some(Rate::Sample),
                "b" => Some(Rate::Block),
                _ => None,
            },
            _ => None,
        };
        if rate.is_none() {
            self.error(
                codes::EXTERNAL_BAD_FIELD,
                value.span(),
                "property 'rate' must be 's' or 'b'",
            );
        }
        rate
    }

    fn check_duplicate_names(
        &mut self,
        inputs: &[PortDecl],
        outputs: &[PortDecl],
        properties: &[PropertyDecl],
    ) {
        let mut seen: std::collections::HashMap<&str, Span> = std::collections::HashMap::new();
        let names = inputs
            .iter()
            .map(|p| (p.name.as_str(), p.span))
            .chain(outputs.iter().map(|p| (p.name.as_str(), p.span)))
            .chain(properties.iter().map(|p| (p.name.as_str(), p.span)));
        let mut duplicates = Vec::new();
        for (name, span) in names {
            if let Some(first) = seen.get(name) {
                duplicates.push((name.to_string(), span, *first));
            } else {
                seen.insert(name, span);
            }
        }
        for (name, span, first) in duplicates {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::EXTERNAL_BAD_FIELD,
                    span,
                    format!("external name '{name}' is declared more than once"),
                )
                .with_related(first, "first declared here"),
            );
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn normalize_src(external: &str) -> ExternalResult {
        let source = format!("program t;\nexternal {external}\nstage main() {{ }}");
        let result = parse(&source);
        assert!(result.errors.is_empty(), "parse failed: {:?}", result.errors);
        normalize(&result.program.unwrap().external)
    }

    #[test]
    fn full_block() {
        let result = normalize_src(
            "{ sr: 48000, block_size: 128, \
             inputs: [ { name: in_l, width: 1 }, { name: in_r, width: 1 } ], \
             outputs: [ { name: out, width: 2 } ], \
             properties: [ { name: gain, type: f32, rate: s } ] }",
        );
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let ext = result.external;
        assert_eq!(ext.sr, 48000);
        assert_eq!(ext.block_size, 128);
        assert_eq!(ext.inputs.len(), 2);
        assert_eq!(ext.inputs[1].name, "in_r");
        assert_eq!(ext.outputs[0].width, 2);
        assert_eq!(ext.properties[0].declared, ScalarType::F32);
        assert_eq!(ext.properties[0].rate, Rate::Sample);
    }

    #[test]
    fn property_rate_defaults_to_block() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, inputs: [], outputs: [], \
             properties: [ { name: gain, type: f64 } ] }",
        );
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.external.properties[0].rate, Rate::Block);
    }

    #[test]
    fn properties_are_f64_semantically() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, inputs: [], outputs: [], \
             properties: [ { name: gain, type: i32 } ] }",
        );
        let prop = &result.external.properties[0];
        assert_eq!(prop.declared, ScalarType::I32);
        assert_eq!(prop.semantic_scalar(), ScalarType::F64);
    }

    #[test]
    fn missing_sr_is_error() {
        let result = normalize_src("{ block_size: 64, inputs: [], outputs: [], properties: [] }");
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("missing 'sr'")));
    }

    #[test]
    fn zero_block_size_is_error() {
        let result =
            normalize_src("{ sr: 48000, block_size: 0, inputs: [], outputs: [], properties: [] }");
        assert!(!result.diagnostics.is_empty());
    }

    #[test]
    fn unknown_field_is_error() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, inputs: [], outputs: [], properties: [], latency: 3 }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("unknown external field")));
    }

    #[test]
    fn duplicate_port_name_is_error() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, \
             inputs: [ { name: x, width: 1 } ], \
             outputs: [ { name: x, width: 1 } ], properties: [] }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("more than once")));
    }

    #[test]
    fn port_missing_width_is_error() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, inputs: [ { name: x } ], outputs: [], properties: [] }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("'name' and 'width'")));
    }

    #[test]
    fn bad_property_rate_is_error() {
        let result = normalize_src(
            "{ sr: 1, block_size: 1, inputs: [], outputs: [], \
             properties: [ { name: g, type: f32, rate: x } ] }",
        );
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("'s' or 'b'")));
    }
}
