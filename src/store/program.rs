//! Matrix programs.
//!
//! A program is a list of 32-bit little-endian words read from a data object
//! when the program is created. Opcodes are `u32`; numeric operands are `f32`
//! bit patterns; matrix-kind operands are `u32`. The accumulator starts at
//! identity and every instruction post-multiplies it.

use cgmath::{Matrix4, Rad, SquareMatrix, Vector3};

use super::matrix::{from_mat4, to_mat4};
use super::StoreError;
use crate::constants::MAX_PROGRAM_INSTRUCTIONS;
use crate::protocol::{Matrix, MatrixKind};

/// Opcode values.
pub mod opcode {
    /// Reset to identity.
    pub const IDENTITY: u32 = 1;
    /// Translate by x, y, z.
    pub const TRANSLATE: u32 = 2;
    /// Scale by x, y, z.
    pub const SCALE: u32 = 3;
    /// Rotate about X (radians).
    pub const ROTATE_X: u32 = 4;
    /// Rotate about Y (radians).
    pub const ROTATE_Y: u32 = 5;
    /// Rotate about Z (radians).
    pub const ROTATE_Z: u32 = 6;
    /// Replace with a system matrix.
    pub const LOAD_SYSTEM: u32 = 7;
    /// Multiply by a system matrix.
    pub const MUL_SYSTEM: u32 = 8;
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    /// Reset to identity.
    Identity,
    /// Post-multiply a translation.
    Translate([f32; 3]),
    /// Post-multiply a non-uniform scale.
    Scale([f32; 3]),
    /// Post-multiply a rotation about X.
    RotateX(f32),
    /// Post-multiply a rotation about Y.
    RotateY(f32),
    /// Post-multiply a rotation about Z.
    RotateZ(f32),
    /// Replace the accumulator with a system matrix.
    LoadSystem(MatrixKind),
    /// Post-multiply a system matrix.
    MulSystem(MatrixKind),
}

/// A validated program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Data object the code was read from.
    pub data: u32,
    instructions: Vec<Instruction>,
}

impl Program {
    /// Parse little-endian words.
    pub fn parse(data: u32, bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() % 4 != 0 {
            return Err(StoreError::invalid("program length is not a multiple of 4"));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();

        let mut instructions = Vec::new();
        let mut pc = 0;
        while pc < words.len() {
            if instructions.len() == MAX_PROGRAM_INSTRUCTIONS {
                return Err(StoreError::invalid(format!(
                    "program exceeds {MAX_PROGRAM_INSTRUCTIONS} instructions"
                )));
            }
            let op = words[pc];
            let arity = match op {
                opcode::IDENTITY => 0,
                opcode::TRANSLATE | opcode::SCALE => 3,
                opcode::ROTATE_X
                | opcode::ROTATE_Y
                | opcode::ROTATE_Z
                | opcode::LOAD_SYSTEM
                | opcode::MUL_SYSTEM => 1,
                other => {
                    return Err(StoreError::invalid(format!("unknown opcode {other} at word {pc}")))
                }
            };
            let Some(args) = words.get(pc + 1..pc + 1 + arity) else {
                return Err(StoreError::invalid(format!("opcode {op} truncated at word {pc}")));
            };
            let f = |i: usize| f32::from_bits(args[i]);
            let kind = |i: usize| {
                u8::try_from(args[i])
                    .ok()
                    .and_then(MatrixKind::from_wire)
                    .ok_or_else(|| StoreError::invalid(format!("invalid matrix kind {}", args[i])))
            };
            instructions.push(match op {
                opcode::IDENTITY => Instruction::Identity,
                opcode::TRANSLATE => Instruction::Translate([f(0), f(1), f(2)]),
                opcode::SCALE => Instruction::Scale([f(0), f(1), f(2)]),
                opcode::ROTATE_X => Instruction::RotateX(f(0)),
                opcode::ROTATE_Y => Instruction::RotateY(f(0)),
                opcode::ROTATE_Z => Instruction::RotateZ(f(0)),
                opcode::LOAD_SYSTEM => Instruction::LoadSystem(kind(0)?),
                _ => Instruction::MulSystem(kind(0)?),
            });
            pc += 1 + arity;
        }

        if instructions.is_empty() {
            return Err(StoreError::invalid("empty program"));
        }
        Ok(Self { data, instructions })
    }

    /// Decoded instructions.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Evaluate, resolving system matrices through `system`.
    pub fn evaluate(&self, system: impl Fn(MatrixKind) -> Matrix) -> Matrix {
        let mut acc = Matrix4::<f32>::identity();
        for ins in &self.instructions {
            acc = match *ins {
                Instruction::Identity => Matrix4::identity(),
                Instruction::Translate(v) => acc * Matrix4::from_translation(Vector3::from(v)),
                Instruction::Scale([x, y, z]) => acc * Matrix4::from_nonuniform_scale(x, y, z),
                Instruction::RotateX(r) => acc * Matrix4::from_angle_x(Rad(r)),
                Instruction::RotateY(r) => acc * Matrix4::from_angle_y(Rad(r)),
                Instruction::RotateZ(r) => acc * Matrix4::from_angle_z(Rad(r)),
                Instruction::LoadSystem(kind) => to_mat4(&system(kind)),
                Instruction::MulSystem(kind) => acc * to_mat4(&system(kind)),
            };
        }
        from_mat4(acc)
    }
}

/// Assemble instructions into little-endian words.
pub fn assemble(instructions: &[Instruction]) -> Vec<u8> {
    let mut words: Vec<u32> = Vec::new();
    for ins in instructions {
        match *ins {
            Instruction::Identity => words.push(opcode::IDENTITY),
            Instruction::Translate(v) => {
                words.push(opcode::TRANSLATE);
                words.extend(v.iter().map(|x| x.to_bits()));
            }
            Instruction::Scale(v) => {
                words.push(opcode::SCALE);
                words.extend(v.iter().map(|x| x.to_bits()));
            }
            Instruction::RotateX(r) => words.extend([opcode::ROTATE_X, r.to_bits()]),
            Instruction::RotateY(r) => words.extend([opcode::ROTATE_Y, r.to_bits()]),
            Instruction::RotateZ(r) => words.extend([opcode::ROTATE_Z, r.to_bits()]),
            Instruction::LoadSystem(k) => words.extend([opcode::LOAD_SYSTEM, u32::from(k.to_wire())]),
            Instruction::MulSystem(k) => words.extend([opcode::MUL_SYSTEM, u32::from(k.to_wire())]),
        }
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IDENTITY;

    fn approx(a: &Matrix, b: &Matrix) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_translate_then_scale() {
        let code = assemble(&[
            Instruction::Translate([1.0, 2.0, 3.0]),
            Instruction::Scale([2.0, 2.0, 2.0]),
        ]);
        let prog = Program::parse(5, &code).unwrap();
        let m = prog.evaluate(|_| IDENTITY);
        // Scale applies first to points, translation stays unscaled.
        assert_eq!(m[0], 2.0);
        assert_eq!(&m[12..15], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_system_matrix_lookup() {
        let mut head = IDENTITY;
        head[13] = 1.7;
        let code = assemble(&[Instruction::LoadSystem(MatrixKind::Head)]);
        let prog = Program::parse(1, &code).unwrap();
        let m = prog.evaluate(|k| if k == MatrixKind::Head { head } else { IDENTITY });
        assert!(approx(&m, &head));
    }

    #[test]
    fn test_rotation_quarter_turn() {
        let code = assemble(&[Instruction::RotateZ(std::f32::consts::FRAC_PI_2)]);
        let m = Program::parse(1, &code).unwrap().evaluate(|_| IDENTITY);
        // X axis maps onto Y.
        assert!((m[0]).abs() < 1e-5);
        assert!((m[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_program_rejected() {
        assert!(Program::parse(1, &[]).is_err());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let code = 99u32.to_le_bytes();
        assert!(matches!(Program::parse(1, &code), Err(StoreError::InvalidRequest(_))));
    }

    #[test]
    fn test_truncated_operands_rejected() {
        let mut code = assemble(&[Instruction::Translate([1.0, 2.0, 3.0])]);
        code.truncate(12);
        assert!(Program::parse(1, &code).is_err());
    }

    #[test]
    fn test_invalid_matrix_kind_rejected() {
        let code: Vec<u8> = [opcode::LOAD_SYSTEM, 7].iter().flat_map(|w| w.to_le_bytes()).collect();
        assert!(Program::parse(1, &code).is_err());
    }

    #[test]
    fn test_instruction_limit() {
        let ok = assemble(&vec![Instruction::Identity; MAX_PROGRAM_INSTRUCTIONS]);
        assert_eq!(Program::parse(1, &ok).unwrap().instructions().len(), MAX_PROGRAM_INSTRUCTIONS);
        let too_many = assemble(&vec![Instruction::Identity; MAX_PROGRAM_INSTRUCTIONS + 1]);
        assert!(Program::parse(1, &too_many).is_err());
    }
}
