use core::fmt::Debug;

use crate::display_utils::HexNum;

/// The registers an x86_64 recipe reads and recovers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegsX86_64 {
    ip: u64,
    sp: u64,
    bp: u64,
}

impl RegsX86_64 {
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        Self { ip, sp, bp }
    }

    #[inline(always)]
    pub fn ip(&self) -> u64 {
        self.ip
    }
    #[inline(always)]
    pub fn set_ip(&mut self, ip: u64) {
        self.ip = ip
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.sp
    }
    #[inline(always)]
    pub fn set_sp(&mut self, sp: u64) {
        self.sp = sp
    }

    #[inline(always)]
    pub fn bp(&self) -> u64 {
        self.bp
    }
    #[inline(always)]
    pub fn set_bp(&mut self, bp: u64) {
        self.bp = bp
    }
}

impl Debug for RegsX86_64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegsX86_64")
            .field("ip", &HexNum(self.ip))
            .field("sp", &HexNum(self.sp))
            .field("bp", &HexNum(self.bp))
            .finish()
    }
}
