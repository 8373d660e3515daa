//! Command codes.

use crate::error::ProtocolError;

/// vproto command codes.
///
/// The codec is agnostic to command meaning; the connection itself only
/// cares about [`CmdCode::Login`] and [`CmdCode::Ping`]. Everything else is
/// driven by the higher-level client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CmdCode {
    Ping = 0,
    Login = 1,
    OpenDatabase = 2,
    CloseDatabase = 3,
    DropDatabase = 4,
    OpenNamespace = 16,
    CloseNamespace = 17,
    DropNamespace = 18,
    AddIndex = 21,
    EnumNamespaces = 22,
    DropIndex = 24,
    UpdateIndex = 25,
    AddTxItem = 26,
    CommitTx = 27,
    RollbackTx = 28,
    StartTransaction = 29,
    Commit = 32,
    ModifyItem = 33,
    DeleteQuery = 34,
    UpdateQuery = 35,
    Select = 48,
    SelectSql = 49,
    FetchResults = 50,
    CloseResults = 51,
    GetMeta = 64,
    PutMeta = 65,
    EnumMeta = 66,
}

impl CmdCode {
    /// The wire representation of this command.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for CmdCode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        Ok(match code {
            0 => CmdCode::Ping,
            1 => CmdCode::Login,
            2 => CmdCode::OpenDatabase,
            3 => CmdCode::CloseDatabase,
            4 => CmdCode::DropDatabase,
            16 => CmdCode::OpenNamespace,
            17 => CmdCode::CloseNamespace,
            18 => CmdCode::DropNamespace,
            21 => CmdCode::AddIndex,
            22 => CmdCode::EnumNamespaces,
            24 => CmdCode::DropIndex,
            25 => CmdCode::UpdateIndex,
            26 => CmdCode::AddTxItem,
            27 => CmdCode::CommitTx,
            28 => CmdCode::RollbackTx,
            29 => CmdCode::StartTransaction,
            32 => CmdCode::Commit,
            33 => CmdCode::ModifyItem,
            34 => CmdCode::DeleteQuery,
            35 => CmdCode::UpdateQuery,
            48 => CmdCode::Select,
            49 => CmdCode::SelectSql,
            50 => CmdCode::FetchResults,
            51 => CmdCode::CloseResults,
            64 => CmdCode::GetMeta,
            65 => CmdCode::PutMeta,
            66 => CmdCode::EnumMeta,
            other => return Err(ProtocolError::InvalidCommand(other)),
        })
    }
}
