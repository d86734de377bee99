//! Compresión de textos.
//!
//! El compresor de abreviaturas es externo a este crate. El compilador
//! solo le entrega todos los textos del programa, en orden, y sustituye
//! cada uno por el bloque que el compresor retorna.

use thiserror::Error;

use crate::ir::Instruction;

/// Un compresor de textos ya codificados.
pub trait TextCompressor {
    /// Retorna un bloque por cada texto de entrada, en el mismo orden.
    fn compress(&mut self, texts: &[Vec<u8>]) -> Vec<Vec<u8>>;
}

/// Compresor identidad.
#[derive(Copy, Clone, Debug, Default)]
pub struct Verbatim;

impl TextCompressor for Verbatim {
    fn compress(&mut self, texts: &[Vec<u8>]) -> Vec<Vec<u8>> {
        texts.to_vec()
    }
}

#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TextError {
    #[error("Text compressor returned {found} texts, expected {expected}")]
    CountMismatch { expected: usize, found: usize },

    #[error("Compressed text {0} contains the terminator byte")]
    Terminator(usize),
}

/// Comprime todos los textos de un programa en su lugar.
pub fn compress<C>(compressor: &mut C, code: &mut [Instruction]) -> Result<(), TextError>
where
    C: TextCompressor + ?Sized,
{
    let texts: Vec<Vec<u8>> = code
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::Text(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .collect();

    let compressed = compressor.compress(&texts);
    if compressed.len() != texts.len() {
        return Err(TextError::CountMismatch {
            expected: texts.len(),
            found: compressed.len(),
        });
    }

    if let Some(index) = compressed.iter().position(|text| text.contains(&0x00)) {
        return Err(TextError::Terminator(index));
    }

    let slots = code.iter_mut().filter_map(|instruction| match instruction {
        Instruction::Text(bytes) => Some(bytes),
        _ => None,
    });

    for (slot, text) in slots.zip(compressed) {
        *slot = text;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Opcode;

    struct Upper;

    impl TextCompressor for Upper {
        fn compress(&mut self, texts: &[Vec<u8>]) -> Vec<Vec<u8>> {
            texts.iter().map(|text| text.to_ascii_uppercase()).collect()
        }
    }

    struct Broken;

    impl TextCompressor for Broken {
        fn compress(&mut self, _: &[Vec<u8>]) -> Vec<Vec<u8>> {
            Vec::new()
        }
    }

    #[test]
    fn texts_are_replaced_in_order() {
        let mut code = vec![
            Instruction::Text(b"uno".to_vec()),
            Instruction::op(Opcode::WaitKey),
            Instruction::Text(b"dos".to_vec()),
        ];

        compress(&mut Upper, &mut code).unwrap();
        assert_eq!(code[0], Instruction::Text(b"UNO".to_vec()));
        assert_eq!(code[2], Instruction::Text(b"DOS".to_vec()));

        let before = code.clone();
        compress(&mut Verbatim, &mut code).unwrap();
        assert_eq!(code, before);
    }

    #[test]
    fn mismatched_output_is_rejected() {
        let mut code = vec![Instruction::Text(b"uno".to_vec())];
        assert_eq!(
            compress(&mut Broken, &mut code),
            Err(TextError::CountMismatch {
                expected: 1,
                found: 0
            })
        );
    }
}
