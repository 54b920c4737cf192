//! Opcodes of the proxy-to-agent protocol.

/// Wire opcode, sent as a little-endian `u32` in the first frame of every
/// message. The numbering is part of the protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    // chunk requests
    PutChunkReq = 0,
    GetChunkReq = 1,
    DelChunkReq = 2,
    CpyChunkReq = 3,
    EncChunkReq = 4,

    // chunk replies
    PutChunkRepSuccess = 5,
    GetChunkRepSuccess = 6,
    DelChunkRepSuccess = 7,
    CpyChunkRepSuccess = 8,
    EncChunkRepSuccess = 9,
    PutChunkRepFail = 10,
    GetChunkRepFail = 11,
    DelChunkRepFail = 12,
    CpyChunkRepFail = 13,
    EncChunkRepFail = 14,

    // agent registration
    RegAgentReq = 15,
    RegAgentRepSuccess = 16,
    RegAgentRepFail = 17,
    UpdAgentReq = 18,
    UpdAgentRep = 19,

    // coordinator keepalive
    SynPing = 20,
    AckPing = 21,

    // proxy instructs an agent to repair from its peers
    RprChunkReq = 22,
    RprChunkRepSuccess = 23,
    RprChunkRepFail = 24,

    // chunk existence check
    ChkChunkReq = 25,
    ChkChunkRepSuccess = 26,
    ChkChunkRepFail = 27,

    // move chunks
    MovChunkReq = 28,
    MovChunkRepSuccess = 29,
    MovChunkRepFail = 30,

    // revert chunks to their previous version
    RvtChunkReq = 31,
    RvtChunkRepSuccess = 32,
    RvtChunkRepFail = 33,

    // agent system info
    GetSysinfoReq = 34,
    GetSysinfoRep = 35,

    // chunk checksum verification
    VrfChunkReq = 36,
    VrfChunkRepSuccess = 37,
    VrfChunkRepFail = 38,

    UnknownOp = 39,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Self {
        use Opcode::*;
        const OPS: [Opcode; 40] = [
            PutChunkReq,
            GetChunkReq,
            DelChunkReq,
            CpyChunkReq,
            EncChunkReq,
            PutChunkRepSuccess,
            GetChunkRepSuccess,
            DelChunkRepSuccess,
            CpyChunkRepSuccess,
            EncChunkRepSuccess,
            PutChunkRepFail,
            GetChunkRepFail,
            DelChunkRepFail,
            CpyChunkRepFail,
            EncChunkRepFail,
            RegAgentReq,
            RegAgentRepSuccess,
            RegAgentRepFail,
            UpdAgentReq,
            UpdAgentRep,
            SynPing,
            AckPing,
            RprChunkReq,
            RprChunkRepSuccess,
            RprChunkRepFail,
            ChkChunkReq,
            ChkChunkRepSuccess,
            ChkChunkRepFail,
            MovChunkReq,
            MovChunkRepSuccess,
            MovChunkRepFail,
            RvtChunkReq,
            RvtChunkRepSuccess,
            RvtChunkRepFail,
            GetSysinfoReq,
            GetSysinfoRep,
            VrfChunkReq,
            VrfChunkRepSuccess,
            VrfChunkRepFail,
            UnknownOp,
        ];
        OPS.get(v as usize).copied().unwrap_or(Opcode::UnknownOp)
    }

    /// The success reply opcode of a request opcode.
    pub fn success_mate(self) -> Opcode {
        match self {
            Opcode::PutChunkReq => Opcode::PutChunkRepSuccess,
            Opcode::GetChunkReq => Opcode::GetChunkRepSuccess,
            Opcode::DelChunkReq => Opcode::DelChunkRepSuccess,
            Opcode::CpyChunkReq => Opcode::CpyChunkRepSuccess,
            Opcode::EncChunkReq => Opcode::EncChunkRepSuccess,
            Opcode::RprChunkReq => Opcode::RprChunkRepSuccess,
            Opcode::ChkChunkReq => Opcode::ChkChunkRepSuccess,
            Opcode::MovChunkReq => Opcode::MovChunkRepSuccess,
            Opcode::RvtChunkReq => Opcode::RvtChunkRepSuccess,
            Opcode::VrfChunkReq => Opcode::VrfChunkRepSuccess,
            Opcode::RegAgentReq => Opcode::RegAgentRepSuccess,
            Opcode::UpdAgentReq => Opcode::UpdAgentRep,
            Opcode::SynPing => Opcode::AckPing,
            Opcode::GetSysinfoReq => Opcode::GetSysinfoRep,
            _ => Opcode::UnknownOp,
        }
    }

    /// The failure reply opcode of a request opcode.
    pub fn fail_mate(self) -> Opcode {
        match self {
            Opcode::PutChunkReq => Opcode::PutChunkRepFail,
            Opcode::GetChunkReq => Opcode::GetChunkRepFail,
            Opcode::DelChunkReq => Opcode::DelChunkRepFail,
            Opcode::CpyChunkReq => Opcode::CpyChunkRepFail,
            Opcode::EncChunkReq => Opcode::EncChunkRepFail,
            Opcode::RprChunkReq => Opcode::RprChunkRepFail,
            Opcode::ChkChunkReq => Opcode::ChkChunkRepFail,
            Opcode::MovChunkReq => Opcode::MovChunkRepFail,
            Opcode::RvtChunkReq => Opcode::RvtChunkRepFail,
            Opcode::VrfChunkReq => Opcode::VrfChunkRepFail,
            Opcode::RegAgentReq => Opcode::RegAgentRepFail,
            _ => Opcode::UnknownOp,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(Opcode::PutChunkReq as u32, 0);
        assert_eq!(Opcode::RegAgentReq as u32, 15);
        assert_eq!(Opcode::SynPing as u32, 20);
        assert_eq!(Opcode::MovChunkRepFail as u32, 30);
        assert_eq!(Opcode::VrfChunkRepFail as u32, 38);
    }

    #[test]
    fn from_u32_round_trip() {
        for v in 0..=39u32 {
            assert_eq!(Opcode::from_u32(v) as u32, v);
        }
        assert_eq!(Opcode::from_u32(1000), Opcode::UnknownOp);
    }

    #[test]
    fn mates() {
        assert_eq!(Opcode::PutChunkReq.success_mate(), Opcode::PutChunkRepSuccess);
        assert_eq!(Opcode::PutChunkReq.fail_mate(), Opcode::PutChunkRepFail);
        assert_eq!(Opcode::SynPing.success_mate(), Opcode::AckPing);
        assert_eq!(Opcode::GetSysinfoReq.success_mate(), Opcode::GetSysinfoRep);
    }
}
