//! Tabla de símbolos y verificación semántica.
//!
//! Cada nombre tiene exactamente una clase ([`SymbolKind`]) durante
//! toda la compilación. Las referencias adelantadas son legales: un
//! `GOTO` puede preceder a su `LABEL`. Por esto la tabla registra
//! tanto la declaración como cada uso, y al final del análisis
//! sintáctico se verifica que todo nombre usado esté declarado con la
//! clase correcta.

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use thiserror::Error;

use crate::{
    lex::Identifier,
    source::{Located, Location},
};

/// Clase de un símbolo.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Label,
    Variable,
    Constant,
    Array,
}

impl Display for SymbolKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Label => fmt.write_str("label"),
            SymbolKind::Variable => fmt.write_str("variable"),
            SymbolKind::Constant => fmt.write_str("constant"),
            SymbolKind::Array => fmt.write_str("array"),
        }
    }
}

/// Contenido de una declaración.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Declaration {
    /// `LABEL nombre` o `#nombre`.
    Label,

    /// `DECLARE índice AS nombre`.
    Variable(u8),

    /// `CONST nombre = valor`.
    Constant(i64),

    /// `DIM nombre(longitud)`.
    Array(u8),
}

impl Declaration {
    pub fn kind(&self) -> SymbolKind {
        match self {
            Declaration::Label => SymbolKind::Label,
            Declaration::Variable(_) => SymbolKind::Variable,
            Declaration::Constant(_) => SymbolKind::Constant,
            Declaration::Array(_) => SymbolKind::Array,
        }
    }
}

/// Un uso de un nombre y la clase que ese uso espera.
#[derive(Clone, Debug)]
pub struct Usage {
    pub location: Location,
    pub kind: SymbolKind,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    name: Identifier,
    declared: Option<(Location, Declaration)>,
    usages: Vec<Usage>,
}

impl Symbol {
    pub fn name(&self) -> &Identifier {
        &self.name
    }

    /// Clase declarada o, si no hay declaración, la del primer uso.
    pub fn kind(&self) -> Option<SymbolKind> {
        self.declared
            .as_ref()
            .map(|(_, declaration)| declaration.kind())
            .or_else(|| self.usages.first().map(|usage| usage.kind))
    }

    pub fn declaration(&self) -> Option<&Declaration> {
        self.declared.as_ref().map(|(_, declaration)| declaration)
    }

    /// Línea de la declaración.
    pub fn declared_line(&self) -> Option<u32> {
        self.declared
            .as_ref()
            .map(|(location, _)| location.start().line())
    }

    pub fn usages(&self) -> &[Usage] {
        &self.usages
    }
}

pub type Semantic<T> = Result<T, Located<SemanticError>>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("{kind} `{name}` was already declared before on line {line}")]
    DeclaredTwice {
        name: Identifier,
        kind: SymbolKind,
        line: u32,
    },

    #[error("`{name}` is declared as a {declared}, cannot be used as a {found}")]
    KindConflict {
        name: Identifier,
        declared: SymbolKind,
        found: SymbolKind,
    },

    #[error("`{name}` was used as a {previous} on line {line}, cannot be used as a {found}")]
    UsageConflict {
        name: Identifier,
        previous: SymbolKind,
        line: u32,
        found: SymbolKind,
    },

    #[error("{kind} `{name}` is not declared (used on lines {lines})")]
    Undeclared {
        name: Identifier,
        kind: SymbolKind,
        lines: String,
    },

    #[error("Names beginning with `__` are reserved: `{0}`")]
    Reserved(Identifier),
}

/// Tabla de símbolos de un programa.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<Identifier, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una declaración.
    pub fn declare(&mut self, id: &Located<Identifier>, declaration: Declaration) -> Semantic<()> {
        let name = id.as_ref();
        if name.as_ref().starts_with("__") {
            return Err(Located::at(
                SemanticError::Reserved(name.clone()),
                id.location().clone(),
            ));
        }

        let symbol = self.entry(name);
        if let Some((location, previous)) = &symbol.declared {
            let error = if previous.kind() == declaration.kind() {
                SemanticError::DeclaredTwice {
                    name: name.clone(),
                    kind: previous.kind(),
                    line: location.start().line(),
                }
            } else {
                SemanticError::KindConflict {
                    name: name.clone(),
                    declared: previous.kind(),
                    found: declaration.kind(),
                }
            };

            return Err(Located::at(error, id.location().clone()));
        }

        symbol.declared = Some((id.location().clone(), declaration));
        Ok(())
    }

    /// Registra un uso con la clase esperada.
    ///
    /// Un uso que contradice a la declaración o a un uso anterior se
    /// rechaza de inmediato y no se registra.
    pub fn use_symbol(&mut self, id: &Located<Identifier>, kind: SymbolKind) -> Semantic<()> {
        let name = id.as_ref();
        let symbol = self.entry(name);

        let error = match (&symbol.declared, symbol.usages.first()) {
            (Some((_, declaration)), _) if declaration.kind() != kind => {
                Some(SemanticError::KindConflict {
                    name: name.clone(),
                    declared: declaration.kind(),
                    found: kind,
                })
            }

            (None, Some(first)) if first.kind != kind => Some(SemanticError::UsageConflict {
                name: name.clone(),
                previous: first.kind,
                line: first.location.start().line(),
                found: kind,
            }),

            _ => None,
        };

        match error {
            Some(error) => Err(Located::at(error, id.location().clone())),
            None => {
                symbol.usages.push(Usage {
                    location: id.location().clone(),
                    kind,
                });

                Ok(())
            }
        }
    }

    /// Verificaciones de fin de programa: nombres usados sin declarar y
    /// usos adelantados cuya clase no coincide con la declaración.
    pub fn finish(&self) -> Vec<Located<SemanticError>> {
        let mut symbols: Vec<&Symbol> = self.symbols.values().collect();
        symbols.sort_by_key(|symbol| {
            symbol
                .usages
                .first()
                .map(|usage| (usage.location.start().line(), usage.location.start().column()))
        });

        let mut errors = Vec::new();
        for symbol in symbols {
            match &symbol.declared {
                None => {
                    if let Some(first) = symbol.usages.first() {
                        let lines: Vec<String> = symbol
                            .usages
                            .iter()
                            .map(|usage| usage.location.start().line().to_string())
                            .collect();

                        errors.push(Located::at(
                            SemanticError::Undeclared {
                                name: symbol.name.clone(),
                                kind: first.kind,
                                lines: lines.join(", "),
                            },
                            first.location.clone(),
                        ));
                    }
                }

                Some((_, declaration)) => {
                    let mismatched = symbol
                        .usages
                        .iter()
                        .filter(|usage| usage.kind != declaration.kind());

                    for usage in mismatched {
                        errors.push(Located::at(
                            SemanticError::KindConflict {
                                name: symbol.name.clone(),
                                declared: declaration.kind(),
                                found: usage.kind,
                            },
                            usage.location.clone(),
                        ));
                    }
                }
            }
        }

        errors
    }

    pub fn get(&self, name: &Identifier) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Clase conocida hasta ahora para un nombre.
    pub fn kind_of(&self, name: &Identifier) -> Option<SymbolKind> {
        self.get(name).and_then(Symbol::kind)
    }

    pub fn variable(&self, name: &Identifier) -> Option<u8> {
        match self.get(name)?.declaration()? {
            Declaration::Variable(slot) => Some(*slot),
            _ => None,
        }
    }

    pub fn constant(&self, name: &Identifier) -> Option<i64> {
        match self.get(name)?.declaration()? {
            Declaration::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn array_len(&self, name: &Identifier) -> Option<u8> {
        match self.get(name)?.declaration()? {
            Declaration::Array(len) => Some(*len),
            _ => None,
        }
    }

    /// Todos los símbolos, ordenados por nombre.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        let mut symbols: Vec<&Symbol> = self.symbols.values().collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        symbols.into_iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn entry(&mut self, name: &Identifier) -> &mut Symbol {
        self.symbols
            .entry(name.clone())
            .or_insert_with(|| Symbol {
                name: name.clone(),
                declared: None,
                usages: Vec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> Located<Identifier> {
        Located::at(Identifier::new(name), Location::default())
    }

    #[test]
    fn forward_references_resolve() {
        let mut table = SymbolTable::new();
        table.use_symbol(&id("start"), SymbolKind::Label).unwrap();
        table.declare(&id("start"), Declaration::Label).unwrap();

        assert!(table.finish().is_empty());
        assert_eq!(table.kind_of(&Identifier::new("start")), Some(SymbolKind::Label));
    }

    #[test]
    fn redeclaration_is_rejected() {
        let mut table = SymbolTable::new();
        table.declare(&id("x"), Declaration::Variable(3)).unwrap();

        let error = table.declare(&id("x"), Declaration::Variable(4)).unwrap_err();
        assert!(matches!(error.val(), SemanticError::DeclaredTwice { .. }));

        let error = table.declare(&id("x"), Declaration::Label).unwrap_err();
        assert!(matches!(error.val(), SemanticError::KindConflict { .. }));
        assert_eq!(table.variable(&Identifier::new("x")), Some(3));
    }

    #[test]
    fn conflicting_usages() {
        let mut table = SymbolTable::new();
        table.use_symbol(&id("x"), SymbolKind::Label).unwrap();

        let error = table.use_symbol(&id("x"), SymbolKind::Variable).unwrap_err();
        assert!(matches!(error.val(), SemanticError::UsageConflict { .. }));
    }

    #[test]
    fn undeclared_and_mismatched_at_end() {
        let mut table = SymbolTable::new();
        table.use_symbol(&id("nowhere"), SymbolKind::Label).unwrap();
        table.use_symbol(&id("arr"), SymbolKind::Variable).unwrap();
        table.declare(&id("arr"), Declaration::Array(4)).unwrap();

        let errors = table.finish();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .any(|error| matches!(error.val(), SemanticError::Undeclared { .. })));
        assert!(errors
            .iter()
            .any(|error| matches!(error.val(), SemanticError::KindConflict { .. })));
    }

    #[test]
    fn reserved_prefix() {
        let mut table = SymbolTable::new();
        let error = table.declare(&id("__LABEL_0"), Declaration::Label).unwrap_err();
        assert!(matches!(error.val(), SemanticError::Reserved(_)));
    }
}
