//! Compilador de aventuras CYD.
//!
//! # Front end
//! Un programa CYD es texto libre con bloques de código entre `[[` y
//! `]]`. El código fuente se somete primero a análisis léxico en
//! [`lex`], de lo cual se obtiene un flujo de tokens. El parser en
//! [`parse`] consume ese flujo y emite directamente la representación
//! intermedia descrita en [`ir`], reduciendo las estructuras de control
//! a etiquetas y saltos. En el mismo recorrido se construye la tabla de
//! símbolos de [`symbols`]. Los errores de estas fases se acumulan en un
//! mismo [`error::Diagnostics`].
//!
//! # Back end
//! La lista de instrucciones pasa por el optimizador de mirilla en
//! [`optimize`] y por el compresor de textos de [`text`]. Finalmente
//! [`codegen`] dispone el bytecode en bancos de memoria y resuelve todos
//! los operandos. Los bloques externos (imágenes, pistas) se ubican
//! después en el espacio sobrante con [`alloc`].

#[macro_use]
mod macros;

pub mod alloc;
pub mod codegen;
pub mod error;
pub mod ir;
pub mod lex;
pub mod optimize;
pub mod parse;
pub mod source;
pub mod symbols;
pub mod text;

use thiserror::Error;

use crate::{
    codegen::{CodegenError, CodegenOptions, CompiledUnit},
    error::Diagnostics,
    ir::Instruction,
    lex::Lexer,
    parse::ParseOptions,
    source::{InputStream, Location},
    symbols::SymbolTable,
    text::{TextCompressor, TextError},
};

/// Opciones de todas las fases.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub parse: ParseOptions,
    pub codegen: CodegenOptions,
}

/// Resultado de una compilación completa.
#[derive(Debug)]
pub struct Compilation {
    /// Instrucciones optimizadas, tal como se generaron.
    pub code: Vec<Instruction>,
    pub symbols: SymbolTable,
    pub unit: CompiledUnit,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{0}")]
    Diagnostics(Diagnostics),

    #[error(transparent)]
    Text(#[from] TextError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// Compila un flujo de entrada.
pub fn compile<S, C>(
    start: Location,
    stream: S,
    compressor: &mut C,
    options: &Options,
) -> Result<Compilation, CompileError>
where
    S: InputStream,
    C: TextCompressor + ?Sized,
{
    let lexer = Lexer::new(start, stream);
    let parsed = parse::parse(lexer, &options.parse).map_err(CompileError::Diagnostics)?;

    let mut code = optimize::optimize(parsed.code);
    text::compress(compressor, &mut code)?;

    let unit = codegen::generate(&code, &parsed.symbols, &options.codegen)?;
    Ok(Compilation {
        code,
        symbols: parsed.symbols,
        unit,
    })
}

/// Compila un texto en memoria sin comprimir sus textos.
pub fn compile_str(text: &str, name: &str, options: &Options) -> Result<Compilation, CompileError> {
    let (start, stream) = source::from_str(text, name);
    compile(start, stream, &mut text::Verbatim, options)
}
