use indexmap::IndexMap;
use saphyr::Yaml;

/// A YAML mapping whose keys are all strings, in document order.
pub type Map<'a> = IndexMap<&'a str, &'a Yaml>;

pub trait Ast {
    /// Name of the node kind, as used in violation messages.
    fn type_name(&self) -> &'static str;
}

impl Ast for Yaml {
    fn type_name(&self) -> &'static str {
        match self {
            Yaml::Null => "nil",
            Yaml::Boolean(_) => "bool",
            Yaml::Integer(n) if *n >= 0 => "uint",
            Yaml::Integer(_) => "int",
            Yaml::Real(_) => "float",
            Yaml::String(_) => "string",
            Yaml::Array(_) => "seq",
            Yaml::Hash(_) => "map",
            Yaml::Alias(_) => "alias",
            _ => "unsupported",
        }
    }
}
