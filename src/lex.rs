//! Análisis léxico.
//!
//! # Modos
//! Un programa CYD es, por omisión, texto libre que se imprime tal cual.
//! El código se encierra entre `[[` y `]]`. El lexer lleva entonces dos
//! modos excluyentes: en modo texto todo carácter forma parte de un
//! [`Token::Text`], mientras que en modo código se reconocen palabras
//! clave, identificadores, números y operadores. Los cambios de modo
//! ocurren únicamente en los delimitadores.
//!
//! # Codificación del texto
//! El intérprete no conoce Unicode. Los caracteres ASCII se preservan,
//! los saltos de línea se codifican como `0x0D`, un conjunto de
//! caracteres del castellano se reubica en los códigos 16 a 29 y otros
//! caracteres comunes se aproximan por su equivalente ASCII. Lo que no
//! tiene equivalente se reporta como error en su posición exacta.
//!
//! # Reglas importantes del lenguaje
//! - Las palabras clave no distinguen mayúsculas de minúsculas, por lo
//!   cual tanto `goto` como `GOTO` y `GoTo` resultan en [`Keyword::Goto`].
//! - Los identificadores sí las distinguen.
//! - Los corchetes anidan dentro de código, de modo que `@v[0]]]` cierra
//!   el índice antes de cerrar el bloque.
//!
//! # Errores
//! El lexer nunca aborta. Cada condición de error se emite como un
//! elemento `Err` del iterador y el escaneo continúa en el siguiente
//! carácter, lo cual permite que el parser reporte varios errores en una
//! misma ejecución.

use crate::source::{self, InputStream, Located, Location};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
    iter::Peekable,
    rc::Rc,
    str::FromStr,
};

use thiserror::Error;

// Case-insensitive
pub use unicase::Ascii as NoCase;

/// Código de salto de línea en el texto codificado.
pub const NEWLINE_CODE: u8 = 0x0D;

/// Caracteres que el intérprete dibuja a partir del código 16.
const SPECIAL_CHARS: [char; 14] = [
    'ª', '¡', '¿', '«', '»', 'á', 'é', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ü', 'Ü',
];

/// Aproximaciones ASCII para caracteres sin glifo propio.
const FALLBACK_CHARS: &[(char, u8)] = &[
    ('Á', b'A'),
    ('É', b'E'),
    ('Í', b'I'),
    ('Ó', b'O'),
    ('Ú', b'U'),
    ('À', b'A'),
    ('È', b'E'),
    ('Ì', b'I'),
    ('Ò', b'O'),
    ('Ù', b'U'),
    ('à', b'a'),
    ('è', b'e'),
    ('ì', b'i'),
    ('ò', b'o'),
    ('ù', b'u'),
    ('â', b'a'),
    ('ê', b'e'),
    ('î', b'i'),
    ('ô', b'o'),
    ('û', b'u'),
    ('ä', b'a'),
    ('ë', b'e'),
    ('ï', b'i'),
    ('ö', b'o'),
    ('ç', b'c'),
    ('Ç', b'C'),
    ('‘', b'\''),
    ('’', b'\''),
    ('´', b'\''),
    ('“', b'"'),
    ('”', b'"'),
    ('–', b'-'),
    ('—', b'-'),
    ('\u{a0}', b' '),
];

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexerError {
    /// Carácter desconocido o inesperado dentro de código.
    #[error("Illegal character {0:?}")]
    BadChar(char),

    /// Carácter de texto que no tiene representación en el intérprete.
    #[error("Invalid character {0:?} ({}) in text", code_point(.0))]
    Encoding(char),

    /// Se esperaba un carácter específico en esta posición.
    #[error("Expected {0}")]
    Expected(&'static str),

    /// Una constante entera se encuentra fuera de rango.
    #[error("Integer literal overflow, valid range is [0, {}]", u32::MAX)]
    IntOverflow,

    /// `[[` dentro de un bloque de código.
    #[error("Invalid opening code token `[[` inside code")]
    NestedOpen,

    /// `]]` fuera de un bloque de código.
    #[error("Invalid closing code token `]]` outside code")]
    UnmatchedClose,

    /// La entrada terminó dentro de un bloque de código.
    #[error("Unterminated code block, expected `]]`")]
    UnterminatedCode,

    /// La entrada terminó dentro de un comentario.
    #[error("Unterminated comment, expected `*/`")]
    UnterminatedComment,

    /// Se utilizó una palabra clave como etiqueta corta.
    #[error("Keyword `{0}` cannot be used as a label")]
    ReservedLabel(Keyword),
}

fn code_point(c: &char) -> u32 {
    *c as u32
}

/// Un identificador.
///
/// Los identificadores distinguen mayúsculas de minúsculas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Rc<str>);

impl Identifier {
    /// Construye un identificador a partir de su lexema.
    pub fn new(name: &str) -> Self {
        Identifier(Rc::from(name))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(fmt)
    }
}

/// Objeto resultante del análisis léxico.
///
/// Un token contiene suficiente información para describir completamente
/// a una entidad léxica en el programa fuente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Texto libre, ya codificado.
    Text(Vec<u8>),

    /// `[[`
    OpenCode,

    /// `]]`
    CloseCode,

    /// Uno o más saltos de línea dentro de código.
    LineBreak,

    /// `:`
    Colon,

    /// Identificador.
    Id(Identifier),

    /// `#etiqueta`
    ShortLabel(Identifier),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal de entero.
    Number(u32),

    /// `+`
    Plus,

    /// `-`
    Minus,

    /// `*`
    Times,

    /// `/`
    Divide,

    /// `&`
    BitAnd,

    /// `|`
    BitOr,

    /// `~`
    BitNot,

    /// `<<`
    ShiftLeft,

    /// `>>`
    ShiftRight,

    /// `=`
    Equals,

    /// `<>`
    NotEquals,

    /// `<`
    Less,

    /// `>`
    Greater,

    /// `<=`
    LessEqual,

    /// `>=`
    GreaterEqual,

    /// `@`
    Indirection,

    /// `,`
    Comma,

    /// `(`
    OpenParen,

    /// `)`
    CloseParen,

    /// `[`
    OpenSquare,

    /// `]`
    CloseSquare,

    /// `{`
    OpenCurly,

    /// `}`
    CloseCurly,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        match self {
            Text(_) => fmt.write_str("text"),
            OpenCode => fmt.write_str("`[[`"),
            CloseCode => fmt.write_str("`]]`"),
            LineBreak => fmt.write_str("line break"),
            Colon => fmt.write_str("`:`"),
            Id(id) => write!(fmt, "identifier `{}`", id),
            ShortLabel(id) => write!(fmt, "label `#{}`", id),
            Keyword(keyword) => write!(fmt, "keyword `{}`", keyword),
            Number(integer) => write!(fmt, "literal `{}`", integer),
            Plus => fmt.write_str("`+`"),
            Minus => fmt.write_str("`-`"),
            Times => fmt.write_str("`*`"),
            Divide => fmt.write_str("`/`"),
            BitAnd => fmt.write_str("`&`"),
            BitOr => fmt.write_str("`|`"),
            BitNot => fmt.write_str("`~`"),
            ShiftLeft => fmt.write_str("`<<`"),
            ShiftRight => fmt.write_str("`>>`"),
            Equals => fmt.write_str("`=`"),
            NotEquals => fmt.write_str("`<>`"),
            Less => fmt.write_str("`<`"),
            Greater => fmt.write_str("`>`"),
            LessEqual => fmt.write_str("`<=`"),
            GreaterEqual => fmt.write_str("`>=`"),
            Indirection => fmt.write_str("`@`"),
            Comma => fmt.write_str("`,`"),
            OpenParen => fmt.write_str("`(`"),
            CloseParen => fmt.write_str("`)`"),
            OpenSquare => fmt.write_str("`[`"),
            CloseSquare => fmt.write_str("`]`"),
            OpenCurly => fmt.write_str("`{`"),
            CloseCurly => fmt.write_str("`}`"),
        }
    }
}

macro_rules! keywords {
    ($($name:ident => $text:literal),* $(,)?) => {
        /// Una palabra clave.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum Keyword {
            $($name),*
        }

        impl Display for Keyword {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                let string = match self {
                    $(Keyword::$name => $text),*
                };

                fmt.write_str(string)
            }
        }

        impl FromStr for Keyword {
            type Err = ();

            fn from_str(string: &str) -> Result<Self, Self::Err> {
                const KEYWORDS: &[(NoCase<&'static str>, Keyword)] = &[
                    $((NoCase::new($text), Keyword::$name)),*
                ];

                KEYWORDS
                    .iter()
                    .find(|&&(name, _)| name == NoCase::new(string))
                    .map(|&(_, keyword)| keyword)
                    .ok_or(())
            }
        }
    };
}

keywords! {
    End       => "END",
    Goto      => "GOTO",
    Gosub     => "GOSUB",
    Return    => "RETURN",
    Label     => "LABEL",
    If        => "IF",
    Then      => "THEN",
    Else      => "ELSE",
    ElseIf    => "ELSEIF",
    EndIf     => "ENDIF",
    While     => "WHILE",
    Wend      => "WEND",
    Do        => "DO",
    Until     => "UNTIL",
    Set       => "SET",
    Let       => "LET",
    To        => "TO",
    Declare   => "DECLARE",
    As        => "AS",
    Const     => "CONST",
    Dim       => "DIM",
    And       => "AND",
    Or        => "OR",
    Not       => "NOT",
    Ink       => "INK",
    Paper     => "PAPER",
    Border    => "BORDER",
    Bright    => "BRIGHT",
    Flash     => "FLASH",
    At        => "AT",
    Print     => "PRINT",
    Char      => "CHAR",
    Margins   => "MARGINS",
    Picture   => "PICTURE",
    Display   => "DISPLAY",
    Sfx       => "SFX",
    Track     => "TRACK",
    Play      => "PLAY",
    Loop      => "LOOP",
    Random    => "RANDOM",
    Randomize => "RANDOMIZE",
    Center    => "CENTER",
    Option    => "OPTION",
    Choose    => "CHOOSE",
    WaitKey   => "WAITKEY",
    InKey     => "INKEY",
    Wait      => "WAIT",
    Pause     => "PAUSE",
    TypeRate  => "TYPERATE",
    Clear     => "CLEAR",
    PagePause => "PAGEPAUSE",
    Tab       => "TAB",
    Newline   => "NEWLINE",
    Backspace => "BACKSPACE",
    RepChar   => "REPCHAR",
    XPos      => "XPOS",
    YPos      => "YPOS",
    Min       => "MIN",
    Max       => "MAX",
    ClearOptions => "CLEAROPTIONS",
    Window     => "WINDOW",
    Blit       => "BLIT",
    FillAttr   => "FILLATTR",
    PutAttr    => "PUTATTR",
    FadeOut    => "FADEOUT",
    MenuConfig => "MENUCONFIG",
    Save       => "SAVE",
    Load       => "LOAD",
    RamSave    => "RAMSAVE",
    RamLoad    => "RAMLOAD",
    GetAttr    => "GETATTR",
    AttrVal    => "ATTRVAL",
    AttrMask   => "ATTRMASK",
    IsDisk     => "ISDISK",
    SaveResult => "SAVERESULT",
    NumOptions => "NUMOPTIONS",
    OptionSel  => "OPTIONSEL",
    OptionVal  => "OPTIONVAL",
}

/// Elemento emitido por el lexer.
pub type Lexeme = Result<Located<Token>, Located<LexerError>>;

/// Modo actual del lexer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    /// Texto libre, estado inicial.
    Text,

    /// Dentro de `[[ ... ]]`.
    Code,
}

/// Máquina de estados para análisis léxico.
///
/// La salida del lexer, así como su siguiente modo, se define a partir
/// de tanto su modo actual como los siguientes caracteres encontrados
/// en el flujo de entrada. Algunos caracteres producen más de un
/// elemento de salida (un texto seguido de `[[`, por ejemplo), por lo
/// cual las salidas pasan por una cola interna.
pub struct Lexer<S: Iterator> {
    source: Peekable<S>,
    mode: Mode,
    next: Location,
    depth: u32,
    pending: VecDeque<Lexeme>,
    finished: bool,
}

impl<S: InputStream> Lexer<S> {
    /// Crea un lexer en estado inicial a partir de un flujo.
    pub fn new(start: Location, source: S) -> Self {
        Lexer {
            source: source.peekable(),
            mode: Mode::Text,
            next: start,
            depth: 0,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Consume un carácter y retorna su propia ubicación.
    fn bump(&mut self) -> Option<(char, Location)> {
        let (c, after) = self.source.next()?;
        let here = std::mem::replace(&mut self.next, after);
        Some((c, here))
    }

    fn peek(&mut self) -> Option<char> {
        self.source.peek().map(|&(c, _)| c)
    }

    /// Consume el siguiente carácter solo si es igual a `expected`.
    fn bump_if(&mut self, expected: char) -> Option<Location> {
        if self.peek() == Some(expected) {
            self.bump().map(|(_, location)| location)
        } else {
            None
        }
    }

    fn token(&mut self, token: Token, from: Location, to: &Location) {
        let location = Location::span(from, to);
        self.pending.push_back(Ok(Located::at(token, location)));
    }

    fn error(&mut self, error: LexerError, location: Location) {
        self.pending.push_back(Err(Located::at(error, location)));
    }

    /// Avanza hasta producir al menos un elemento o agotar la entrada.
    fn advance(&mut self) {
        match self.mode {
            Mode::Text => self.text(),
            Mode::Code => self.code(),
        }
    }

    /// Acumula un texto hasta `[[` o hasta el final de la entrada.
    fn text(&mut self) {
        let mut bytes = Vec::new();
        let mut span: Option<(Location, Location)> = None;

        loop {
            let (c, location) = match self.bump() {
                Some(next) => next,
                None => {
                    self.finished = true;
                    break;
                }
            };

            match c {
                '[' => match self.bump_if('[') {
                    Some(second) => {
                        self.mode = Mode::Code;
                        self.depth = 0;

                        // El texto se emite antes que el delimitador
                        let text = span.take();
                        if let Some((from, to)) = text {
                            if !bytes.is_empty() {
                                self.token(Token::Text(std::mem::take(&mut bytes)), from, &to);
                            }
                        }

                        self.token(Token::OpenCode, location, &second);

                        return;
                    }

                    None => {
                        mark(&mut span, &location);
                        bytes.push(b'[');
                    }
                },

                ']' if self.peek() == Some(']') => {
                    if let Some(second) = self.bump_if(']') {
                        self.error(LexerError::UnmatchedClose, Location::span(location, &second));
                    }
                }

                '\r' => {
                    mark(&mut span, &location);
                    if let Some(lf) = self.bump_if('\n') {
                        mark(&mut span, &lf);
                    }

                    bytes.push(NEWLINE_CODE);
                }

                '\n' => {
                    mark(&mut span, &location);
                    bytes.push(NEWLINE_CODE);
                }

                '\0' => self.error(LexerError::BadChar(c), location),

                c => {
                    mark(&mut span, &location);
                    match encode(c) {
                        Some(byte) => bytes.push(byte),
                        None => self.error(LexerError::Encoding(c), location),
                    }
                }
            }
        }

        if let Some((from, to)) = span {
            if !bytes.is_empty() {
                self.token(Token::Text(bytes), from, &to);
            }
        }
    }

    /// Escanea un token de código, o sale del modo código.
    fn code(&mut self) {
        use Token::*;

        loop {
            let (c, start) = match self.bump() {
                Some(next) => next,
                None => {
                    let location = self.next.clone();
                    self.error(LexerError::UnterminatedCode, location);
                    self.finished = true;
                    return;
                }
            };

            let simple = match c {
                ' ' | '\t' => continue,

                '\r' | '\n' => {
                    let mut last = start.clone();
                    while let Some('\r') | Some('\n') = self.peek() {
                        if let Some((_, location)) = self.bump() {
                            last = location;
                        }
                    }

                    self.token(LineBreak, start, &last);
                    return;
                }

                '[' => match self.bump_if('[') {
                    Some(second) => {
                        self.error(LexerError::NestedOpen, Location::span(start, &second));
                        return;
                    }

                    None => {
                        self.depth += 1;
                        OpenSquare
                    }
                },

                ']' if self.depth > 0 => {
                    self.depth -= 1;
                    CloseSquare
                }

                ']' => match self.bump_if(']') {
                    Some(second) => {
                        self.mode = Mode::Text;
                        self.token(CloseCode, start, &second);
                        return;
                    }

                    None => CloseSquare,
                },

                '/' => match self.bump_if('*') {
                    Some(_) => {
                        self.comment(start);
                        return;
                    }

                    None => Divide,
                },

                '<' => {
                    if let Some(end) = self.bump_if('<') {
                        self.token(ShiftLeft, start, &end);
                    } else if let Some(end) = self.bump_if('=') {
                        self.token(LessEqual, start, &end);
                    } else if let Some(end) = self.bump_if('>') {
                        self.token(NotEquals, start, &end);
                    } else {
                        let end = start.clone();
                        self.token(Less, start, &end);
                    }

                    return;
                }

                '>' => {
                    if let Some(end) = self.bump_if('>') {
                        self.token(ShiftRight, start, &end);
                    } else if let Some(end) = self.bump_if('=') {
                        self.token(GreaterEqual, start, &end);
                    } else {
                        let end = start.clone();
                        self.token(Greater, start, &end);
                    }

                    return;
                }

                ':' => Colon,
                '@' => Indirection,
                ',' => Comma,
                '(' => OpenParen,
                ')' => CloseParen,
                '{' => OpenCurly,
                '}' => CloseCurly,
                '+' => Plus,
                '-' => Minus,
                '*' => Times,
                '&' => BitAnd,
                '|' => BitOr,
                '~' => BitNot,
                '=' => Equals,

                '#' => {
                    self.short_label(start);
                    return;
                }

                '$' => {
                    self.number(start, 16, None);
                    return;
                }

                '%' => {
                    self.number(start, 2, None);
                    return;
                }

                '0' if matches!(self.peek(), Some('x') | Some('X')) => {
                    self.bump();
                    self.number(start, 16, None);
                    return;
                }

                '0' if matches!(self.peek(), Some('b') | Some('B')) => {
                    self.bump();
                    self.number(start, 2, None);
                    return;
                }

                c if c.is_ascii_digit() => {
                    self.number(start, 10, c.to_digit(10));
                    return;
                }

                c if is_word_start(c) => {
                    let (word, end) = self.word(c, start.clone());
                    let token = match self::Keyword::from_str(&word) {
                        Ok(keyword) => Keyword(keyword),
                        Err(()) => Id(Identifier::new(&word)),
                    };

                    self.token(token, start, &end);
                    return;
                }

                c => {
                    self.error(LexerError::BadChar(c), start);
                    return;
                }
            };

            let end = start.clone();
            self.token(simple, start, &end);
            return;
        }
    }

    /// Descarta un comentario `/* ... */`, que puede abarcar líneas.
    fn comment(&mut self, start: Location) {
        loop {
            match self.bump() {
                Some(('*', _)) => {
                    if self.bump_if('/').is_some() {
                        return;
                    }
                }

                Some(_) => (),
                None => {
                    self.error(LexerError::UnterminatedComment, start);
                    return;
                }
            }
        }
    }

    /// Acumula dígito por dígito una constante en la base dada.
    fn number(&mut self, start: Location, radix: u32, first: Option<u32>) {
        let mut end = start.clone();
        let mut accumulated = first.map(u64::from);
        let mut overflow = false;

        while let Some(digit) = self.peek().and_then(|c| c.to_digit(radix)) {
            if let Some((_, location)) = self.bump() {
                end = location;
            }

            let value = accumulated.unwrap_or(0) * u64::from(radix) + u64::from(digit);
            overflow |= value > u64::from(u32::MAX);
            accumulated = Some(value.min(u64::from(u32::MAX) + 1));
        }

        let location = Location::span(start, &end);
        match accumulated {
            None => self.error(LexerError::Expected("a digit"), location),
            Some(_) if overflow => {
                // El valor de reemplazo evita errores en cascada
                self.error(LexerError::IntOverflow, location.clone());
                self.pending
                    .push_back(Ok(Located::at(Token::Number(0), location)));
            }

            Some(value) => self
                .pending
                .push_back(Ok(Located::at(Token::Number(value as u32), location))),
        }
    }

    /// Escanea un término que puede ser identificador o palabra clave.
    fn word(&mut self, first: char, start: Location) -> (String, Location) {
        let mut word = first.to_string();
        let mut end = start;

        while let Some(c) = self.peek().filter(|&c| is_word_char(c)) {
            word.push(c);
            if let Some((_, location)) = self.bump() {
                end = location;
            }
        }

        (word, end)
    }

    fn short_label(&mut self, start: Location) {
        let first = match self.peek().filter(|&c| is_word_start(c)) {
            Some(_) => self.bump(),
            None => None,
        };

        let (first, location) = match first {
            Some(first) => first,
            None => {
                self.error(LexerError::Expected("a label name after `#`"), start);
                return;
            }
        };

        let (word, end) = self.word(first, location);
        match Keyword::from_str(&word) {
            Ok(keyword) => self.error(LexerError::ReservedLabel(keyword), Location::span(start, &end)),
            Err(()) => self.token(Token::ShortLabel(Identifier::new(&word)), start, &end),
        }
    }
}

impl<S: InputStream> Iterator for Lexer<S> {
    type Item = Lexeme;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() && !self.finished {
            self.advance();
        }

        self.pending.pop_front()
    }
}

/// Construye un lexer sobre un texto en memoria.
pub fn tokenize(text: &str, name: &str) -> Lexer<impl InputStream> {
    let (start, stream) = source::from_str(text, name.to_owned());
    Lexer::new(start, stream)
}

/// Codifica un carácter de texto para el intérprete.
///
/// El byte `0x00` termina los textos, por lo que `'\0'` no se codifica.
pub fn encode(c: char) -> Option<u8> {
    if c == '\0' {
        return None;
    }

    if c.is_ascii() {
        return Some(c as u8);
    }

    SPECIAL_CHARS
        .iter()
        .position(|&special| special == c)
        .map(|index| 16 + index as u8)
        .or_else(|| {
            FALLBACK_CHARS
                .iter()
                .find(|&&(from, _)| from == c)
                .map(|&(_, to)| to)
        })
}

/// Extiende el rango de un texto en curso hasta `location`.
fn mark(span: &mut Option<(Location, Location)>, location: &Location) {
    if let Some((_, last)) = span {
        *last = location.clone();
    } else {
        *span = Some((location.clone(), location.clone()));
    }
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Determina si un carácter puede pertenecer a un término.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
