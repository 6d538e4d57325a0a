/// The eight argument/result registers `w0`..`w7` of an FF-A call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FfaArgs(pub [u64; 8]);

impl FfaArgs {
    /// Builds the registers of a call to `function`, followed by up to seven arguments.
    pub fn new(function: u32, args: &[u64]) -> Self {
        let mut regs = [0; 8];
        regs[0] = function.into();
        for (reg, arg) in regs[1..].iter_mut().zip(args) {
            *reg = *arg;
        }
        Self(regs)
    }

    /// The low 32 bits of register `index`, as used by the SMC32 calling convention.
    pub fn w(&self, index: usize) -> u32 {
        self.0[index] as u32
    }

    pub fn function(&self) -> u32 {
        self.w(0)
    }
}

/// Issues FF-A calls to the partition manager.
///
/// The instruction used to trap into the partition manager is up to the implementation.
pub trait Transport {
    /// Performs one call and returns the result registers.
    fn call(&mut self, args: FfaArgs) -> FfaArgs;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn call(&mut self, args: FfaArgs) -> FfaArgs {
        (**self).call(args)
    }
}
