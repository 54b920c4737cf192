//! Client-facing wire protocol.
//!
//! Requests and replies are sequences of length-prefixed frames inside a
//! length-delimited envelope; the first frame is always the little-endian
//! opcode. Failed operations answer with exactly one frame carrying the
//! failure opcode.

mod server;

pub use server::run_client_interface;

/// Client protocol opcode. Wire values are fixed; the `*_REP_SUCCESS` and
/// `*_REP_FAIL` mates directly follow their request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientOpcode {
    WriteFileReq = 0,
    WriteFileRepSuccess = 1,
    WriteFileRepFail = 2,

    ReadFileReq = 3,
    ReadFileRepSuccess = 4,
    ReadFileRepFail = 5,

    AppendFileReq = 6,
    AppendFileRepSuccess = 7,
    AppendFileRepFail = 8,
    GetAppendSizeReq = 9,
    GetAppendSizeRepSuccess = 10,
    GetAppendSizeRepFail = 11,

    DelFileReq = 12,
    DelFileRepSuccess = 13,
    DelFileRepFail = 14,

    ReadFileRangeReq = 15,
    ReadFileRangeRepSuccess = 16,
    ReadFileRangeRepFail = 17,
    GetReadSizeReq = 18,
    GetReadSizeRepSuccess = 19,
    GetReadSizeRepFail = 20,

    RenameFileReq = 21,
    RenameFileRepSuccess = 22,
    RenameFileRepFail = 23,

    GetCapacityReq = 24,
    GetCapacityRepSuccess = 25,
    GetCapacityRepFail = 26,

    GetFileListReq = 27,
    GetFileListRepSuccess = 28,
    GetFileListRepFail = 29,

    GetAgentStatusReq = 30,
    GetAgentStatusRepSuccess = 31,
    GetAgentStatusRepFail = 32,

    OverwriteFileReq = 33,
    OverwriteFileRepSuccess = 34,
    OverwriteFileRepFail = 35,

    GetBgTaskPrgReq = 36,
    GetBgTaskPrgRepSuccess = 37,
    GetBgTaskPrgRepFail = 38,

    CopyFileReq = 39,
    CopyFileRepSuccess = 40,
    CopyFileRepFail = 41,

    GetRepairStatsReq = 42,
    GetRepairStatsRepSuccess = 43,
    GetRepairStatsRepFail = 44,

    GetProxyStatusReq = 45,
    GetProxyStatusRepSuccess = 46,
    GetProxyStatusRepFail = 47,

    UnknownClientOp = 48,
}

impl ClientOpcode {
    pub fn from_u32(v: u32) -> Self {
        use ClientOpcode::*;
        const OPS: [ClientOpcode; 49] = [
            WriteFileReq,
            WriteFileRepSuccess,
            WriteFileRepFail,
            ReadFileReq,
            ReadFileRepSuccess,
            ReadFileRepFail,
            AppendFileReq,
            AppendFileRepSuccess,
            AppendFileRepFail,
            GetAppendSizeReq,
            GetAppendSizeRepSuccess,
            GetAppendSizeRepFail,
            DelFileReq,
            DelFileRepSuccess,
            DelFileRepFail,
            ReadFileRangeReq,
            ReadFileRangeRepSuccess,
            ReadFileRangeRepFail,
            GetReadSizeReq,
            GetReadSizeRepSuccess,
            GetReadSizeRepFail,
            RenameFileReq,
            RenameFileRepSuccess,
            RenameFileRepFail,
            GetCapacityReq,
            GetCapacityRepSuccess,
            GetCapacityRepFail,
            GetFileListReq,
            GetFileListRepSuccess,
            GetFileListRepFail,
            GetAgentStatusReq,
            GetAgentStatusRepSuccess,
            GetAgentStatusRepFail,
            OverwriteFileReq,
            OverwriteFileRepSuccess,
            OverwriteFileRepFail,
            GetBgTaskPrgReq,
            GetBgTaskPrgRepSuccess,
            GetBgTaskPrgRepFail,
            CopyFileReq,
            CopyFileRepSuccess,
            CopyFileRepFail,
            GetRepairStatsReq,
            GetRepairStatsRepSuccess,
            GetRepairStatsRepFail,
            GetProxyStatusReq,
            GetProxyStatusRepSuccess,
            GetProxyStatusRepFail,
            UnknownClientOp,
        ];
        OPS.get(v as usize).copied().unwrap_or(UnknownClientOp)
    }

    pub fn success_mate(self) -> ClientOpcode {
        ClientOpcode::from_u32(self as u32 + 1)
    }

    pub fn fail_mate(self) -> ClientOpcode {
        ClientOpcode::from_u32(self as u32 + 2)
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            ClientOpcode::WriteFileReq
                | ClientOpcode::ReadFileReq
                | ClientOpcode::AppendFileReq
                | ClientOpcode::GetAppendSizeReq
                | ClientOpcode::DelFileReq
                | ClientOpcode::ReadFileRangeReq
                | ClientOpcode::GetReadSizeReq
                | ClientOpcode::RenameFileReq
                | ClientOpcode::GetCapacityReq
                | ClientOpcode::GetFileListReq
                | ClientOpcode::GetAgentStatusReq
                | ClientOpcode::OverwriteFileReq
                | ClientOpcode::GetBgTaskPrgReq
                | ClientOpcode::CopyFileReq
                | ClientOpcode::GetRepairStatsReq
                | ClientOpcode::GetProxyStatusReq
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(ClientOpcode::WriteFileReq as u32, 0);
        assert_eq!(ClientOpcode::ReadFileRangeReq as u32, 15);
        assert_eq!(ClientOpcode::OverwriteFileReq as u32, 33);
        assert_eq!(ClientOpcode::GetProxyStatusRepFail as u32, 47);
    }

    #[test]
    fn mates_follow_requests() {
        for v in 0..=48u32 {
            let op = ClientOpcode::from_u32(v);
            assert_eq!(op as u32, v);
            if op.is_request() {
                assert_eq!(op.success_mate() as u32, v + 1);
                assert_eq!(op.fail_mate() as u32, v + 2);
            }
        }
    }
}
