//! Builtin registry: single source of truth for builtin names and
//! arities. The parser resolves call syntax against these tables; the
//! evaluator implements them.

/// A generic builtin function entry.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub description: &'static str,
}

/// All generic builtins. Predicate builtins (closure-taking) live in
/// [`PREDICATES`] instead and are parsed with dedicated arity rules.
pub static BUILTINS: &[BuiltinFn] = &[
    // ── Collections & strings ───────────────────────────────────
    BuiltinFn { name: "len", min_args: 1, max_args: 1, description: "Length of an array, map, or string" },
    BuiltinFn { name: "first", min_args: 1, max_args: 1, description: "First element of an array, or nil" },
    BuiltinFn { name: "last", min_args: 1, max_args: 1, description: "Last element of an array, or nil" },
    BuiltinFn { name: "keys", min_args: 1, max_args: 1, description: "Keys of a map, sorted" },
    BuiltinFn { name: "values", min_args: 1, max_args: 1, description: "Values of a map, in key order" },
    BuiltinFn { name: "sort", min_args: 1, max_args: 1, description: "Sorted copy of a numeric or string array" },
    BuiltinFn { name: "reverse", min_args: 1, max_args: 1, description: "Reversed copy of an array" },
    BuiltinFn { name: "sum", min_args: 1, max_args: 1, description: "Sum of a numeric array" },
    BuiltinFn { name: "min", min_args: 1, max_args: usize::MAX, description: "Minimum of an array or of the arguments" },
    BuiltinFn { name: "max", min_args: 1, max_args: usize::MAX, description: "Maximum of an array or of the arguments" },
    BuiltinFn { name: "indexOf", min_args: 2, max_args: 2, description: "Index of a substring or element, or -1" },
    BuiltinFn { name: "join", min_args: 1, max_args: 2, description: "Join an array of strings with a separator" },
    BuiltinFn { name: "split", min_args: 2, max_args: 2, description: "Split a string on a separator" },
    BuiltinFn { name: "trim", min_args: 1, max_args: 2, description: "Trim whitespace, or the given characters" },
    BuiltinFn { name: "trimPrefix", min_args: 2, max_args: 2, description: "Remove a leading prefix if present" },
    BuiltinFn { name: "trimSuffix", min_args: 2, max_args: 2, description: "Remove a trailing suffix if present" },
    BuiltinFn { name: "upper", min_args: 1, max_args: 1, description: "Uppercase a string" },
    BuiltinFn { name: "lower", min_args: 1, max_args: 1, description: "Lowercase a string" },
    BuiltinFn { name: "hasPrefix", min_args: 2, max_args: 2, description: "String starts with prefix" },
    BuiltinFn { name: "hasSuffix", min_args: 2, max_args: 2, description: "String ends with suffix" },
    // ── Numbers & conversions ───────────────────────────────────
    BuiltinFn { name: "abs", min_args: 1, max_args: 1, description: "Absolute value" },
    BuiltinFn { name: "ceil", min_args: 1, max_args: 1, description: "Round up" },
    BuiltinFn { name: "floor", min_args: 1, max_args: 1, description: "Round down" },
    BuiltinFn { name: "round", min_args: 1, max_args: 1, description: "Round to nearest" },
    BuiltinFn { name: "int", min_args: 1, max_args: 1, description: "Convert to integer" },
    BuiltinFn { name: "float", min_args: 1, max_args: 1, description: "Convert to float" },
    BuiltinFn { name: "string", min_args: 1, max_args: 1, description: "Convert to string" },
    BuiltinFn { name: "type", min_args: 1, max_args: 1, description: "Type name of a value" },
];

/// Predicate builtins and their arities (subject included). All take a
/// closure as the trailing argument; `reduce` additionally accepts an
/// optional initial value.
pub static PREDICATES: &[(&str, usize)] = &[
    ("all", 2),
    ("none", 2),
    ("any", 2),
    ("one", 2),
    ("filter", 2),
    ("map", 2),
    ("count", 2),
    ("find", 2),
    ("findIndex", 2),
    ("findLast", 2),
    ("findLastIndex", 2),
    ("groupBy", 2),
    ("reduce", 3),
];

pub fn lookup_builtin(name: &str) -> Option<&'static BuiltinFn> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn predicate_arity(name: &str) -> Option<usize> {
    PREDICATES
        .iter()
        .find(|&&(n, _)| n == name)
        .map(|&(_, arity)| arity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_are_not_generic_builtins() {
        for (name, _) in PREDICATES {
            assert!(lookup_builtin(name).is_none(), "{name} listed twice");
        }
    }

    #[test]
    fn lookup_finds_entries() {
        assert_eq!(lookup_builtin("len").map(|b| b.min_args), Some(1));
        assert!(lookup_builtin("no_such_builtin").is_none());
        assert_eq!(predicate_arity("reduce"), Some(3));
        assert_eq!(predicate_arity("filter"), Some(2));
        assert_eq!(predicate_arity("len"), None);
    }
}
