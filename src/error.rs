//! Reporte de errores con ubicación.
//!
//! Las fases delanteras (lexer y parser) acumulan errores en un mismo
//! [`Diagnostics`] en vez de abortar al primero. El colector tiene un
//! límite: una vez alcanzado, los errores siguientes se descartan pero
//! el análisis continúa hasta el final de la entrada.

use crate::source::{Located, Location};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Límite de errores por omisión.
pub const DEFAULT_MAX_ERRORS: usize = 20;

mod sealed {
    pub trait Sealed {}
}

/// Un error cualquiera acompañado de su ubicación.
pub trait LocatedError: sealed::Sealed {
    fn source(&self) -> &dyn Error;
    fn location(&self) -> &Location;
}

pub struct Diagnostics {
    kind: &'static str,
    errors: Vec<Box<dyn 'static + LocatedError>>,
    max_errors: usize,
    max_errors_reached: bool,
}

impl Diagnostics {
    /// Crea un colector vacío que guarda a lo sumo `max_errors` errores.
    pub fn with_limit(max_errors: usize) -> Self {
        Diagnostics {
            max_errors: max_errors.max(1),
            ..Default::default()
        }
    }

    pub fn kind(self, kind: &'static str) -> Self {
        Diagnostics { kind, ..self }
    }

    /// Registra un error, o lo descarta si ya se alcanzó el límite.
    pub fn push<E: 'static + LocatedError>(&mut self, error: E) {
        if self.errors.len() >= self.max_errors {
            self.max_errors_reached = true;
        } else {
            self.errors.push(Box::new(error));
            if self.errors.len() == self.max_errors {
                self.max_errors_reached = true;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Indica si algún error se descartó o si el límite se llenó.
    pub fn max_errors_reached(&self) -> bool {
        self.max_errors_reached
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn LocatedError + 'static)> {
        self.errors.iter().map(|error| &**error)
    }

    /// Mensajes de error sin ubicación, en orden de aparición.
    pub fn messages(&self) -> Vec<String> {
        self.iter().map(|error| error.source().to_string()).collect()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            kind: "error",
            errors: Default::default(),
            max_errors: DEFAULT_MAX_ERRORS,
            max_errors_reached: false,
        }
    }
}

impl<E: 'static + LocatedError> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        let mut diagnostics = Diagnostics::default();
        diagnostics.push(error);
        diagnostics
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_list()
            .entries(
                self.iter()
                    .map(|error| format!("{}: {}", error.location(), error.source())),
            )
            .finish()
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostics { kind, errors, .. } = self;

        if errors.is_empty() {
            return writeln!(fmt, "No errors were reported");
        }

        for error in errors {
            writeln!(fmt, "{}: {}", kind, error.source())?;

            let location = error.location();
            writeln!(fmt, " --> {}", location)?;

            let digits = location.end().line().to_string().chars().count();
            writeln!(fmt, "{:digits$} |", "", digits = digits)?;

            for line_number in location.start().line()..=location.end().line() {
                location.source().with_line(line_number, |line| {
                    writeln!(fmt, "{:>digits$} | {}", line_number, line, digits = digits)
                })?
            }

            let (from, to) = (location.start().column(), location.end().column().max(2) - 1);
            let min = from.min(to);
            let max = from.max(to);

            let skip = (min - 1) as usize;
            let highlight = (max - min + 1) as usize;

            writeln!(
                fmt,
                "{:digits$} | {:skip$}{:^<highlight$}",
                "",
                "",
                "",
                digits = digits,
                skip = skip,
                highlight = highlight
            )?;

            writeln!(fmt)?;
        }

        if self.max_errors_reached {
            writeln!(fmt, "Too many errors, stopped reporting")?;
        }

        let error_or_errors = if errors.len() == 1 { "error" } else { "errors" };
        writeln!(
            fmt,
            "Build failed with {} {}",
            errors.len(),
            error_or_errors
        )
    }
}

impl<E: Error> sealed::Sealed for Located<E> {}

impl<E: Error> LocatedError for Located<E> {
    fn source(&self) -> &dyn Error {
        self.as_ref()
    }

    fn location(&self) -> &Location {
        Located::location(self)
    }
}
