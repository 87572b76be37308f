//! Elementwise product of two states: `out[] = in1[] * in2[]`.

use crate::nn::module::{binary, binary_mut, check_shape, Module, ModuleResult};
use crate::tensor::State;
use ndarray::Zip;

#[derive(Debug, Clone, Copy, Default)]
pub struct Multiplication;

impl Multiplication {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Multiplication {
    fn name(&self) -> &'static str {
        "multiplication"
    }

    fn arity(&self) -> usize {
        2
    }

    fn fprop(&mut self, inputs: &[&State], output: &mut State) -> ModuleResult<()> {
        let (input1, input2) = binary(self.name(), inputs)?;
        check_shape("multiplication input2", input1.shape(), input2.shape())?;
        output.resize(input1.shape());
        Zip::from(&mut output.x)
            .and(&input1.x)
            .and(&input2.x)
            .for_each(|o, &a, &b| *o = a * b);
        Ok(())
    }

    fn bprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        let shape = input1.shape().to_vec();
        check_shape("multiplication input2", &shape, input2.shape())?;
        check_shape("multiplication input1.dx", &shape, input1.dx.shape())?;
        check_shape("multiplication input2.dx", &shape, input2.dx.shape())?;
        check_shape("multiplication output.dx", &shape, output.dx.shape())?;
        Zip::from(&mut input1.dx)
            .and(&mut input2.dx)
            .and(&input1.x)
            .and(&input2.x)
            .and(&output.dx)
            .for_each(|d1, d2, &a, &b, &g| {
                *d1 += g * b;
                *d2 += g * a;
            });
        Ok(())
    }

    fn bbprop_input(&mut self, inputs: &mut [&mut State], output: &State) -> ModuleResult<()> {
        let (input1, input2) = binary_mut(self.name(), inputs)?;
        let shape = input1.shape().to_vec();
        check_shape("multiplication input2", &shape, input2.shape())?;
        check_shape("multiplication input1.ddx", &shape, input1.ddx.shape())?;
        check_shape("multiplication input2.ddx", &shape, input2.ddx.shape())?;
        check_shape("multiplication output.ddx", &shape, output.ddx.shape())?;
        Zip::from(&mut input1.ddx)
            .and(&mut input2.ddx)
            .and(&input1.x)
            .and(&input2.x)
            .and(&output.ddx)
            .for_each(|dd1, dd2, &a, &b, &h| {
                *dd1 += h * b * b;
                *dd2 += h * a * a;
            });
        Ok(())
    }
}
