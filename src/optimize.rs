//! Optimización por mirilla.
//!
//! Una única pasada hacia adelante que fusiona pares de instrucciones
//! adyacentes en su forma directa. La pasada es idempotente: aplicarla
//! dos veces produce lo mismo que aplicarla una.

use log::debug;

use crate::ir::{Instruction, Opcode, Operand};

/// Optimiza una lista de instrucciones y garantiza un `END` final.
pub fn optimize(code: Vec<Instruction>) -> Vec<Instruction> {
    let before = code.len();
    let mut output = Vec::with_capacity(before + 1);
    let mut fused = 0;

    let mut code = code.into_iter().peekable();
    while let Some(instruction) = code.next() {
        let merged = match code.peek() {
            Some(next) => fuse(&instruction, next),
            None => None,
        };

        match merged {
            Some(merged) => {
                code.next();
                output.push(merged);
                fused += 1;
            }

            None => output.push(instruction),
        }
    }

    if output.last().and_then(Instruction::opcode) != Some(Opcode::End) {
        output.push(Instruction::op(Opcode::End));
    }

    debug!(
        "optimizer: {} fusions, {} -> {} instructions",
        fused,
        before,
        output.len()
    );

    output
}

/// Intenta fusionar dos instrucciones consecutivas.
fn fuse(first: &Instruction, second: &Instruction) -> Option<Instruction> {
    let (first, operands) = match first {
        Instruction::Code { opcode, operands } => (*opcode, operands),
        _ => return None,
    };

    let (second, targets) = match second {
        Instruction::Code { opcode, operands } => (*opcode, operands),
        _ => return None,
    };

    let fused = match (first, second) {
        (Opcode::PushD, Opcode::PopSet) => Instruction::with(Opcode::SetD, join(targets, operands)),
        (Opcode::PushI, Opcode::PopSet) => Instruction::with(Opcode::SetI, join(targets, operands)),
        (Opcode::PushI, Opcode::PopPrint) => Instruction::with(Opcode::PrintI, operands.clone()),
        (Opcode::Not, Opcode::IfNGoto) => Instruction::with(Opcode::IfGoto, targets.clone()),
        (Opcode::PushD, pop) => Instruction::with(direct(pop)?, operands.clone()),
        _ => return None,
    };

    Some(fused)
}

fn join(first: &[Operand], second: &[Operand]) -> Vec<Operand> {
    first.iter().chain(second).cloned().collect()
}

/// Forma directa de cada `POP_*` de un argumento.
fn direct(pop: Opcode) -> Option<Opcode> {
    let opcode = match pop {
        Opcode::PopInk => Opcode::InkD,
        Opcode::PopPaper => Opcode::PaperD,
        Opcode::PopBorder => Opcode::BorderD,
        Opcode::PopPrint => Opcode::PrintD,
        Opcode::PopBright => Opcode::BrightD,
        Opcode::PopFlash => Opcode::FlashD,
        Opcode::PopPicture => Opcode::PictureD,
        Opcode::PopDisplay => Opcode::DisplayD,
        Opcode::PopSfx => Opcode::SfxD,
        Opcode::PopTrack => Opcode::TrackD,
        Opcode::PopPlay => Opcode::PlayD,
        Opcode::PopLoop => Opcode::LoopD,
        Opcode::PopChar => Opcode::CharD,
        _ => return None,
    };

    Some(opcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::VarRef, lex::Identifier};

    fn push(value: u8) -> Instruction {
        Instruction::with(Opcode::PushD, vec![Operand::Literal(value)])
    }

    fn var(slot: u8) -> Operand {
        Operand::Variable(VarRef::slot(slot))
    }

    #[test]
    fn direct_forms() {
        let code = vec![
            push(7),
            Instruction::with(Opcode::PopSet, vec![var(3)]),
            push(2),
            Instruction::op(Opcode::PopInk),
            Instruction::with(Opcode::PushI, vec![var(4)]),
            Instruction::op(Opcode::PopPrint),
            Instruction::with(Opcode::PushI, vec![var(5)]),
            Instruction::with(Opcode::PopSet, vec![var(6)]),
        ];

        assert_eq!(
            optimize(code),
            vec![
                Instruction::with(Opcode::SetD, vec![var(3), Operand::Literal(7)]),
                Instruction::with(Opcode::InkD, vec![Operand::Literal(2)]),
                Instruction::with(Opcode::PrintI, vec![var(4)]),
                Instruction::with(Opcode::SetI, vec![var(6), var(5)]),
                Instruction::op(Opcode::End),
            ]
        );
    }

    #[test]
    fn negated_jump() {
        let label = Operand::Label(Identifier::new("__LABEL_0"));
        let code = vec![
            Instruction::with(Opcode::PushI, vec![var(0)]),
            Instruction::op(Opcode::Not),
            Instruction::with(Opcode::IfNGoto, vec![label.clone()]),
            Instruction::op(Opcode::End),
        ];

        assert_eq!(
            optimize(code),
            vec![
                Instruction::with(Opcode::PushI, vec![var(0)]),
                Instruction::with(Opcode::IfGoto, vec![label]),
                Instruction::op(Opcode::End),
            ]
        );
    }

    #[test]
    fn labels_block_fusion() {
        let code = vec![
            push(1),
            Instruction::Label(Identifier::new("here")),
            Instruction::op(Opcode::PopPrint),
        ];

        let optimized = optimize(code.clone());
        assert_eq!(&optimized[..3], &code[..]);
        assert_eq!(optimized.len(), 4);
    }

    #[test]
    fn idempotent_with_single_end() {
        let code = vec![
            push(1),
            Instruction::op(Opcode::PopPrint),
            Instruction::op(Opcode::End),
        ];

        let once = optimize(code);
        let twice = optimize(once.clone());
        assert_eq!(once, twice);

        let ends = twice
            .iter()
            .filter(|instruction| instruction.opcode() == Some(Opcode::End))
            .count();
        assert_eq!(ends, 1);
        assert_eq!(optimize(Vec::new()), vec![Instruction::op(Opcode::End)]);
    }
}
