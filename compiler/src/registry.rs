// registry.rs — Built-in node metadata registry
//
// The innermost scope tier: metadata for every built-in the language
// exposes (math functions, width adapters, filter designers, delay-line and
// RNG primitives, conversion nodes, math constants, the external port
// arrays). Kind metadata declares which input pins exist, which names alias
// which indices, whether the built-in is variadic, and how its result rate
// is derived.

use std::fmt;

use serde::Serialize;

use crate::ast::TypeLitKind;

// ── Scalar types, shapes, rates ─────────────────────────────────────────────

/// Primitive scalar types carried on edges.
///
/// Masks are `Bool` semantically; their bit representation is a backend
/// concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl ScalarType {
    pub fn is_integral(self) -> bool {
        matches!(self, ScalarType::I32 | ScalarType::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn is_bool(self) -> bool {
        self == ScalarType::Bool
    }

    pub fn is_numeric(self) -> bool {
        !self.is_bool()
    }
}

impl From<TypeLitKind> for ScalarType {
    fn from(kind: TypeLitKind) -> Self {
        match kind {
            TypeLitKind::I32 => ScalarType::I32,
            TypeLitKind::I64 => ScalarType::I64,
            TypeLitKind::F32 => ScalarType::F32,
            TypeLitKind::F64 => ScalarType::F64,
            TypeLitKind::Bool => ScalarType::Bool,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// The static signature of a value on an edge: scalar type plus channel
/// count (width ≥ 1; a scalar value is width 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Shape {
    pub scalar: ScalarType,
    pub width: u32,
}

impl Shape {
    pub fn new(scalar: ScalarType, width: u32) -> Shape {
        Shape { scalar, width }
    }

    pub fn scalar_of(scalar: ScalarType) -> Shape {
        Shape { scalar, width: 1 }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.scalar, self.width)
    }
}

/// How often a value changes. The derived ordering is the rate lattice:
/// `Constant < Block < Sample`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rate {
    Constant,
    Block,
    Sample,
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rate::Constant => "C",
            Rate::Block => "B",
            Rate::Sample => "S",
        };
        write!(f, "{name}")
    }
}

// ── Built-in metadata ───────────────────────────────────────────────────────

/// Metadata for one input pin: its name alias and whether it must be
/// connected. Pins are addressable both by index and by name.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PinMeta {
    pub name: &'static str,
    pub required: bool,
}

const fn pin(name: &'static str) -> PinMeta {
    PinMeta {
        name,
        required: true,
    }
}

/// How a built-in's result rate is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RatePolicy {
    /// Maximum of the input rates (the default rate arithmetic).
    MaxOfInputs,
    /// Always the given rate, regardless of inputs.
    Fixed(Rate),
}

/// Static metadata for a function-like built-in.
#[derive(Debug, Clone, Serialize)]
pub struct KindMeta {
    /// Lookup path: `sin`, `biquad.lowpass`, …
    pub path: &'static str,
    /// Fixed input pins, in index order. Names alias indices.
    pub inputs: &'static [PinMeta],
    /// Whether additional unnamed inputs beyond `inputs` are accepted
    /// (`merge`, `select`).
    pub variadic: bool,
    /// Number of output pins for non-`split` kinds (`split` derives its
    /// output count from its width arguments).
    pub outputs: u32,
    pub rate: RatePolicy,
}

/// Function-like built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BuiltinFn {
    If,
    Select,
    Broadcast,
    Truncate,
    Merge,
    Split,
    Slice,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Min,
    Max,
    Pow,
    Clamp,
    CastI32,
    CastI64,
    CastF32,
    CastF64,
    CastBool,
    BiquadLowpass,
    BiquadHighpass,
    BiquadBandpass,
    Xoroshiro,
    DelRead,
    DelWrite,
    Sr,
    Clock,
}

impl BuiltinFn {
    /// The cast target for conversion built-ins, if this is one.
    pub fn cast_target(self) -> Option<ScalarType> {
        match self {
            BuiltinFn::CastI32 => Some(ScalarType::I32),
            BuiltinFn::CastI64 => Some(ScalarType::I64),
            BuiltinFn::CastF32 => Some(ScalarType::F32),
            BuiltinFn::CastF64 => Some(ScalarType::F64),
            BuiltinFn::CastBool => Some(ScalarType::Bool),
            _ => None,
        }
    }
}

/// Math constants (C-rate `f64(1)` literals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MathConst {
    Pi,
    E,
    Tau,
}

impl MathConst {
    pub fn value(self) -> f64 {
        match self {
            MathConst::Pi => std::f64::consts::PI,
            MathConst::E => std::f64::consts::E,
            MathConst::Tau => std::f64::consts::TAU,
        }
    }
}

/// What a tier-1 name resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Builtin {
    Fn(BuiltinFn),
    Const(MathConst),
    /// The external input port array (`input[k]` or by declared name).
    Inputs,
    /// The external output port array.
    Outputs,
}

// ── The static table ────────────────────────────────────────────────────────

struct Entry {
    func: BuiltinFn,
    meta: KindMeta,
}

macro_rules! entry {
    ($func:ident, $path:literal, [$($pin:literal),*], variadic: $variadic:literal,
     outputs: $outputs:literal, rate: $rate:expr) => {
        Entry {
            func: BuiltinFn::$func,
            meta: KindMeta {
                path: $path,
                inputs: &[$(pin($pin)),*],
                variadic: $variadic,
                outputs: $outputs,
                rate: $rate,
            },
        }
    };
}

static TABLE: &[Entry] = &[
    entry!(If, "if", ["cond", "then", "else"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Select, "select", ["index"], variadic: true, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Broadcast, "broadcast", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Truncate, "truncate", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Merge, "merge", [], variadic: true, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Split, "split", ["input"], variadic: false, outputs: 0, rate: RatePolicy::MaxOfInputs),
    entry!(Slice, "slice", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Sin, "sin", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Cos, "cos", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Tan, "tan", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Sinh, "sinh", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Cosh, "cosh", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Tanh, "tanh", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Min, "min", ["a", "b"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Max, "max", ["a", "b"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Pow, "pow", ["base", "exponent"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(Clamp, "clamp", ["value", "lower", "upper"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(CastI32, "i32", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(CastI64, "i64", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(CastF32, "f32", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(CastF64, "f64", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(CastBool, "bool", ["input"], variadic: false, outputs: 1, rate: RatePolicy::MaxOfInputs),
    entry!(BiquadLowpass, "biquad.lowpass", ["input", "frequency", "q"], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
    entry!(BiquadHighpass, "biquad.highpass", ["input", "frequency", "q"], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
    entry!(BiquadBandpass, "biquad.bandpass", ["input", "frequency", "q"], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
    entry!(Xoroshiro, "xoroshiro", [], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
    entry!(DelRead, "delread", ["delay"], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
    entry!(DelWrite, "delwrite", ["value"], variadic: false, outputs: 0, rate: RatePolicy::MaxOfInputs),
    entry!(Sr, "sr", [], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Constant)),
    entry!(Clock, "clock", [], variadic: false, outputs: 1, rate: RatePolicy::Fixed(Rate::Sample)),
];

// ── Registry ────────────────────────────────────────────────────────────────

/// The built-in registry. All metadata is static; the struct exists so that
/// lookups and the canonical fingerprint flow through one place.
#[derive(Debug, Default)]
pub struct Registry;

impl Registry {
    pub fn new() -> Self {
        Registry
    }

    /// Number of function-like built-ins.
    pub fn len(&self) -> usize {
        TABLE.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look up a single-segment tier-1 name.
    pub fn lookup_name(&self, name: &str) -> Option<Builtin> {
        match name {
            "input" => return Some(Builtin::Inputs),
            "output" => return Some(Builtin::Outputs),
            "pi" => return Some(Builtin::Const(MathConst::Pi)),
            "e" => return Some(Builtin::Const(MathConst::E)),
            "tau" => return Some(Builtin::Const(MathConst::Tau)),
            _ => {}
        }
        TABLE
            .iter()
            .find(|entry| entry.meta.path == name)
            .map(|entry| Builtin::Fn(entry.func))
    }

    /// Look up a dotted path (`biquad.lowpass`).
    pub fn lookup_path(&self, segments: &[&str]) -> Option<Builtin> {
        match segments {
            [single] => self.lookup_name(single),
            [module, member] => {
                let joined = format!("{module}.{member}");
                TABLE
                    .iter()
                    .find(|entry| entry.meta.path == joined)
                    .map(|entry| Builtin::Fn(entry.func))
            }
            _ => None,
        }
    }

    /// True if `name` is a built-in module prefix (`biquad`).
    pub fn is_module(&self, name: &str) -> bool {
        let prefix = format!("{name}.");
        TABLE.iter().any(|entry| entry.meta.path.starts_with(&prefix))
    }

    /// Kind metadata for a function-like built-in.
    pub fn meta(&self, func: BuiltinFn) -> &'static KindMeta {
        &TABLE
            .iter()
            .find(|entry| entry.func == func)
            .expect("every BuiltinFn has a table entry")
            .meta
    }

    /// Canonical compact JSON of the registry, for fingerprinting. Entries
    /// are emitted in table order, which is fixed at compile time.
    pub fn canonical_json(&self) -> String {
        let metas: Vec<&KindMeta> = TABLE.iter().map(|entry| &entry.meta).collect();
        serde_json::to_string(&metas).expect("registry metadata serializes")
    }
}

// ── Tests ──
