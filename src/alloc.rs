//! Ubicación de bloques externos en bancos.
//!
//! Imágenes y pistas musicales se guardan en el espacio que sobra en los
//! bancos de código, o en bancos adicionales. Cada bloque se asigna al
//! banco en que deja menos espacio libre ("best fit"). Si algún bloque
//! no cabe en ninguno, se agrega un banco vacío y se repite la
//! asignación completa desde el principio.

use std::fmt::{self, Display};

use log::debug;
use thiserror::Error;

/// Tipo de un bloque externo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Image,
    Track,
}

impl BlockKind {
    /// Código con que el intérprete identifica el tipo de bloque.
    pub fn code(self) -> u8 {
        match self {
            BlockKind::Image => 1,
            BlockKind::Track => 2,
        }
    }
}

impl Display for BlockKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Image => fmt.write_str("image"),
            BlockKind::Track => fmt.write_str("track"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub id: u8,
    pub size: usize,
}

/// Límites de memoria del sistema objetivo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Cantidad de bancos disponibles, incluyendo los de código.
    pub max_banks: usize,

    /// Tamaño de un banco adicional.
    pub bank_size: usize,

    /// Dirección de inicio de un banco adicional.
    pub bank_base: u16,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget {
            max_banks: 8,
            bank_size: 16384,
            bank_base: 0xC000,
        }
    }
}

/// Ocupación de un banco.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BankUsage {
    pub base: u16,
    pub used: usize,
    pub free: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub block: Block,
    pub bank: usize,
    pub address: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub placements: Vec<Placement>,
    pub banks: Vec<BankUsage>,
}

#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("Not enough memory available")]
    NotEnoughMemory,

    #[error("{kind} {id} ends past the end of the address space")]
    AddressOverflow { kind: BlockKind, id: u8 },
}

/// Asigna cada bloque a un banco.
///
/// `code` describe los bancos que ya ocupa el bytecode, en orden.
pub fn allocate(
    code: &[BankUsage],
    blocks: &[Block],
    budget: &MemoryBudget,
) -> Result<Allocation, AllocError> {
    let mut count = code.len();
    if count > budget.max_banks {
        return Err(AllocError::NotEnoughMemory);
    }

    loop {
        let mut banks = code.to_vec();
        banks.resize(
            count,
            BankUsage {
                base: budget.bank_base,
                used: 0,
                free: budget.bank_size,
            },
        );

        match best_fit(&mut banks, blocks)? {
            Some(placements) => {
                debug!(
                    "allocator: {} blocks in {} banks ({} added)",
                    placements.len(),
                    banks.len(),
                    banks.len() - code.len()
                );

                return Ok(Allocation { placements, banks });
            }

            None if count < budget.max_banks => count += 1,
            None => return Err(AllocError::NotEnoughMemory),
        }
    }
}

/// Intento de asignación con una cantidad fija de bancos.
fn best_fit(banks: &mut [BankUsage], blocks: &[Block]) -> Result<Option<Vec<Placement>>, AllocError> {
    let mut placements = Vec::with_capacity(blocks.len());

    for block in blocks {
        // `min_by_key` se queda con el primero entre iguales
        let best = banks
            .iter()
            .enumerate()
            .filter(|(_, bank)| bank.free >= block.size)
            .min_by_key(|(_, bank)| bank.free - block.size)
            .map(|(index, _)| index);

        let index = match best {
            Some(index) => index,
            None => return Ok(None),
        };

        let bank = &mut banks[index];
        let address = usize::from(bank.base) + bank.used;
        if address + block.size > 0x10000 {
            return Err(AllocError::AddressOverflow {
                kind: block.kind,
                id: block.id,
            });
        }

        placements.push(Placement {
            block: *block,
            bank: index,
            address: address as u16,
        });

        bank.used += block.size;
        bank.free -= block.size;
    }

    Ok(Some(placements))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: u8, size: usize) -> Block {
        Block {
            kind: BlockKind::Image,
            id,
            size,
        }
    }

    fn empty(size: usize) -> BankUsage {
        BankUsage {
            base: 0xC000,
            used: 0,
            free: size,
        }
    }

    #[test]
    fn block_larger_than_any_bank() {
        let budget = MemoryBudget {
            max_banks: 2,
            bank_size: 8192,
            bank_base: 0xC000,
        };

        let blocks = [image(0, 5000), image(1, 9000), image(2, 3000)];
        let result = allocate(&[empty(8192), empty(8192)], &blocks, &budget);
        assert_eq!(result, Err(AllocError::NotEnoughMemory));

        // Más bancos del mismo tamaño tampoco alcanzan
        let budget = MemoryBudget {
            max_banks: 6,
            ..budget
        };
        let result = allocate(&[empty(8192), empty(8192)], &blocks, &budget);
        assert_eq!(result, Err(AllocError::NotEnoughMemory));
    }

    #[test]
    fn picks_tightest_bank() {
        let code = [
            BankUsage {
                base: 0xC000,
                used: 10000,
                free: 6384,
            },
            BankUsage {
                base: 0xC000,
                used: 14000,
                free: 2384,
            },
        ];

        let allocation = allocate(&code, &[image(0, 2000), image(1, 6000)], &MemoryBudget::default())
            .unwrap();

        assert_eq!(allocation.placements[0].bank, 1);
        assert_eq!(allocation.placements[0].address, 0xC000 + 14000);
        assert_eq!(allocation.placements[1].bank, 0);
        assert_eq!(allocation.banks[0].free, 384);
        assert_eq!(allocation.banks[1].free, 384);
    }

    #[test]
    fn ties_go_to_lowest_bank() {
        let allocation = allocate(
            &[empty(4000), empty(4000)],
            &[image(0, 1000)],
            &MemoryBudget::default(),
        )
        .unwrap();

        assert_eq!(allocation.placements[0].bank, 0);
    }

    #[test]
    fn grows_until_everything_fits() {
        let budget = MemoryBudget::default();
        let blocks = [image(0, 12000), image(1, 12000)];
        let allocation = allocate(&[empty(1000)], &blocks, &budget).unwrap();

        assert_eq!(allocation.banks.len(), 3);
        assert_eq!(allocation.placements[0].bank, 1);
        assert_eq!(allocation.placements[1].bank, 2);
        assert_eq!(allocation.placements[1].address, 0xC000);
    }

    #[test]
    fn too_many_code_banks() {
        let budget = MemoryBudget {
            max_banks: 1,
            ..MemoryBudget::default()
        };

        let result = allocate(&[empty(10), empty(10)], &[], &budget);
        assert_eq!(result, Err(AllocError::NotEnoughMemory));
    }
}
