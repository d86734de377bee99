//! Rastreo de ubicaciones originales en código fuente.
//!
//! Los distintos objetos internos que el compilador construye
//! deben llevar cuenta de posiciones o rangos de ubicaciones en
//! el código fuente original, lo cual permite determinar un punto
//! exacto o aproximado en donde ocurre un error.
//!
//! El preprocesador de inclusiones (externo a este crate) concatena
//! varios archivos en uno solo. Si se adjunta su [`LineMap`] al origen,
//! las ubicaciones se reportan contra el archivo y línea originales.

use std::{
    fmt::{self, Debug, Display, Formatter},
    io::{self, Read},
    ops::Range,
    rc::Rc,
};

/// Ancho de los divisores de tabulador.
const TAB_STOP: u32 = 4;

/// Un flujo de entrada, carácter por carácter.
pub trait InputStream: Iterator<Item = (char, Location)> {}

impl<I: Iterator<Item = (char, Location)>> InputStream for I {}

/// Un objeto cualquiera con una posición original asociada.
#[derive(Debug, Clone)]
pub struct Located<T> {
    location: Location,
    value: T,
}

impl<T> Located<T> {
    /// Obtiene el valor.
    pub fn val(&self) -> &T {
        &self.value
    }

    /// Obtiene la ubicación.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Descarta la ubicación y toma ownership del valor.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Descompone y toma ownership de las dos partes.
    pub fn split(self) -> (Location, T) {
        (self.location, self.value)
    }

    /// Construye a partir de un valor y una ubicación.
    pub fn at(value: T, location: Location) -> Self {
        Located { value, location }
    }

    /// Transforma el valor con la misma ubicación.
    pub fn map<U, F>(self, map: F) -> Located<U>
    where
        F: FnOnce(T) -> U,
    {
        Located {
            value: map(self.value),
            location: self.location,
        }
    }
}

impl<T> AsRef<T> for Located<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

/// Una ubicación está conformada por un origen y un rango de posiciones.
#[derive(Clone)]
pub struct Location {
    from: Rc<Source>,
    position: Range<Position>,
}

impl Location {
    /// Unifica un rango de ubicaciones. Se asume el mismo origen.
    pub fn span(from: Location, to: &Location) -> Self {
        Location {
            from: from.from,
            position: from.position.start..to.position.end,
        }
    }

    /// Obtiene la posición de inicio.
    pub fn start(&self) -> Position {
        self.position.start
    }

    /// Obtiene la posición de fin.
    pub fn end(&self) -> Position {
        self.position.end
    }

    /// Obtiene el origen de esta ubicación.
    pub fn source(&self) -> &Source {
        &self.from
    }

    /// Línea de inicio, traducida al archivo original si hay mapa de líneas.
    pub fn origin(&self) -> (&str, u32) {
        self.from.origin(self.position.start.line)
    }
}

impl Default for Location {
    /// Ubicación sin origen, para errores que no ocurren en ningún archivo.
    fn default() -> Self {
        Location {
            from: Rc::new(Source {
                name: String::from("<input>"),
                lines: Vec::new(),
                line_map: None,
            }),
            position: Position::default()..Position::default().advance(),
        }
    }
}

impl Display for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let Range { start, end } = self.position;
        let (name, line) = self.from.origin(start.line);
        write!(formatter, "{}:", name)?;

        if line != start.line {
            // Las columnas no cambian al traducir la línea
            return write!(formatter, "{}:{}", line, start.column);
        }

        if end == start.advance() {
            // Solo se señala una columna en específico
            write!(formatter, "{}", start)
        } else {
            write!(formatter, "[{}-{}]", start, end.back())
        }
    }
}

impl Debug for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Una posición línea-columna en un archivo.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Position {
    /// Obtiene el número de línea.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Obtiene el número de columna.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Incrementa el número de columna.
    pub fn advance(self) -> Position {
        Position {
            line: self.line,
            column: self.column + 1,
        }
    }

    /// Decrementa el número de columna.
    pub fn back(self) -> Position {
        Position {
            line: self.line,
            column: self.column.saturating_sub(1).max(1),
        }
    }

    /// Incrementa el número de línea y retorna a la columna 1.
    pub fn newline(self) -> Position {
        Position {
            line: self.line + 1,
            column: 1,
        }
    }

    /// Ajusta la posición a la siguiente columna de tabulador.
    pub fn tab(self) -> Position {
        let column = 1 + ((self.column - 1) / TAB_STOP + 1) * TAB_STOP;
        Position {
            line: self.line,
            column,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Display for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}

/// Correspondencia entre líneas de la salida del preprocesador
/// y su archivo y línea de procedencia.
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    lines: Vec<(Rc<str>, u32)>,
}

impl LineMap {
    /// Crea un mapa vacío.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra la siguiente línea de salida como proveniente de `file:line`.
    pub fn push(&mut self, file: &str, line: u32) {
        // Archivos consecutivos comparten la misma cadena
        let file = match self.lines.last() {
            Some((last, _)) if &**last == file => Rc::clone(last),
            _ => Rc::from(file),
        };

        self.lines.push((file, line));
    }

    /// Busca el origen de una línea de salida (base 1).
    pub fn lookup(&self, line: u32) -> Option<(&str, u32)> {
        let index = (line as usize).checked_sub(1)?;
        self.lines
            .get(index)
            .map(|(file, line)| (&**file, *line))
    }
}

/// Nombre de origen, líneas completas y mapa de procedencia opcional.
pub struct Source {
    name: String,
    lines: Vec<String>,
    line_map: Option<LineMap>,
}

impl Source {
    /// Nombre del origen.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoca `f` con el contenido de una línea, o con una línea vacía
    /// si el número de línea no existe.
    pub fn with_line<T, F>(&self, line: u32, f: F) -> T
    where
        F: FnOnce(&str) -> T,
    {
        let index = (line as usize).saturating_sub(1);
        f(self.lines.get(index).map(String::as_str).unwrap_or(""))
    }

    fn origin(&self, line: u32) -> (&str, u32) {
        self.line_map
            .as_ref()
            .and_then(|map| map.lookup(line))
            .unwrap_or((self.name.as_str(), line))
    }
}

/// Transforma un flujo de entrada estándar en uno que itera por carácter.
///
/// La entrada se lee completa antes de emitir el primer carácter. La
/// ubicación que se encuentra en la tupla de retorno es la posición que le
/// corresponderá al primer caracter en la salida. Cada carácter emitido
/// incluye a la ubicación del siguiente.
pub fn consume<R, S>(mut reader: R, name: S) -> io::Result<(Location, impl InputStream)>
where
    R: Read,
    S: Into<String>,
{
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    Ok(from_text(text, name, None))
}

/// Igual que [`consume()`], pero a partir de texto ya resuelto por el
/// preprocesador y su mapa de líneas.
pub fn preprocessed<S: Into<String>>(
    text: String,
    name: S,
    line_map: LineMap,
) -> (Location, impl InputStream) {
    from_text(text, name, Some(line_map))
}

/// Origen en memoria, útil principalmente para pruebas.
pub fn from_str<S: Into<String>>(text: &str, name: S) -> (Location, impl InputStream) {
    from_text(text.to_owned(), name, None)
}

fn from_text<S: Into<String>>(
    text: String,
    name: S,
    line_map: Option<LineMap>,
) -> (Location, impl InputStream) {
    let source = Rc::new(Source {
        name: name.into(),
        lines: text.lines().map(str::to_owned).collect(),
        line_map,
    });

    let start = Location {
        from: Rc::clone(&source),
        position: Position::default()..Position::default().advance(),
    };

    let chars: Vec<char> = text.chars().collect();
    let mut here = Position::default();

    let stream = (0..chars.len()).map(move |index| {
        let c = chars[index];
        let next = match c {
            '\n' => here.newline(),
            '\r' if chars.get(index + 1) != Some(&'\n') => here.newline(),
            '\t' => here.tab(),
            _ => here.advance(),
        };

        here = next;
        let location = Location {
            from: Rc::clone(&source),
            position: next..next.advance(),
        };

        (c, location)
    });

    (start, stream)
}
