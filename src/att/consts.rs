use super::*;

/// Command Flag bit of an attribute opcode ([Vol 3] Part F, Section 3.3.1).
const CMD_FLAG: u8 = 1 << 6;

/// Attribute opcode ([Vol 3] Part F, Section 3.4.8).
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    ErrorRsp = 0x01,
    ExchangeMtuReq = 0x02,
    ExchangeMtuRsp = 0x03,
    FindInformationReq = 0x04,
    FindInformationRsp = 0x05,
    FindByTypeValueReq = 0x06,
    FindByTypeValueRsp = 0x07,
    ReadByTypeReq = 0x08,
    ReadByTypeRsp = 0x09,
    ReadReq = 0x0A,
    ReadRsp = 0x0B,
    ReadBlobReq = 0x0C,
    ReadBlobRsp = 0x0D,
    ReadMultipleReq = 0x0E,
    ReadMultipleRsp = 0x0F,
    ReadByGroupTypeReq = 0x10,
    ReadByGroupTypeRsp = 0x11,
    WriteReq = 0x12,
    WriteRsp = 0x13,
    PrepareWriteReq = 0x16,
    PrepareWriteRsp = 0x17,
    ExecuteWriteReq = 0x18,
    ExecuteWriteRsp = 0x19,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    WriteCmd = 0x52,
    SignedWriteCmd = 0xD2,
}

impl Opcode {
    /// Returns whether a raw opcode, which may be unknown, is a command.
    #[inline]
    #[must_use]
    pub const fn is_cmd(op: u8) -> bool {
        op & CMD_FLAG != 0
    }

    /// Returns an error response without a handle.
    #[inline]
    pub const fn err<R>(self, err: ErrorCode) -> RspResult<R> {
        Err(ErrorRsp::new(self as _, None, err))
    }

    /// Returns an error response for handle `hdl`.
    #[inline]
    pub const fn hdl_err<R>(self, err: ErrorCode, hdl: Handle) -> RspResult<R> {
        Err(ErrorRsp::new(self as _, Some(hdl), err))
    }

    /// Returns the PDU type ([Vol 3] Part F, Section 3.3).
    #[must_use]
    pub const fn typ(self) -> PduType {
        use Opcode::*;
        match self {
            WriteCmd | SignedWriteCmd => PduType::Cmd,
            HandleValueNtf => PduType::Ntf,
            HandleValueInd => PduType::Ind,
            HandleValueCfm => PduType::Cfm,
            ErrorRsp | ExchangeMtuRsp | FindInformationRsp | FindByTypeValueRsp
            | ReadByTypeRsp | ReadRsp | ReadBlobRsp | ReadMultipleRsp | ReadByGroupTypeRsp
            | WriteRsp | PrepareWriteRsp | ExecuteWriteRsp => PduType::Rsp,
            ExchangeMtuReq | FindInformationReq | FindByTypeValueReq | ReadByTypeReq
            | ReadReq | ReadBlobReq | ReadMultipleReq | ReadByGroupTypeReq | WriteReq
            | PrepareWriteReq | ExecuteWriteReq => PduType::Req,
        }
    }

    /// Returns the opcode that completes a request or an indication.
    #[must_use]
    pub const fn rsp(self) -> Option<Self> {
        use Opcode::*;
        Some(match self {
            ExchangeMtuReq => ExchangeMtuRsp,
            FindInformationReq => FindInformationRsp,
            FindByTypeValueReq => FindByTypeValueRsp,
            ReadByTypeReq => ReadByTypeRsp,
            ReadReq => ReadRsp,
            ReadBlobReq => ReadBlobRsp,
            ReadMultipleReq => ReadMultipleRsp,
            ReadByGroupTypeReq => ReadByGroupTypeRsp,
            WriteReq => WriteRsp,
            PrepareWriteReq => PrepareWriteRsp,
            ExecuteWriteReq => ExecuteWriteRsp,
            HandleValueInd => HandleValueCfm,
            _ => return None,
        })
    }
}

/// Attribute PDU type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PduType {
    /// Client to server, no response.
    Cmd,
    /// Client to server, one response.
    Req,
    /// Server to client reply to a request.
    Rsp,
    /// Server to client, no confirmation.
    Ntf,
    /// Server to client, one confirmation.
    Ind,
    /// Client to server reply to an indication.
    Cfm,
}

/// Error codes carried by `ATT_ERROR_RSP` ([Vol 3] Part F, Section 3.4.1.1)
/// and the common profile codes from \[CSS\] Part B, Section 1.2. Attribute
/// read and write handlers return these to reject an access.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    /// Read or write offset is past the end of the value.
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    /// Nothing matched in the requested handle range. Ends discovery.
    AttributeNotFound = 0x0A,
    /// Value fits in a single read response.
    AttributeNotLong = 0x0B,
    EncryptionKeySizeTooShort = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
    DatabaseOutOfSync = 0x12,
    ValueNotAllowed = 0x13,
    WriteRequestRejected = 0xFC,
    /// CCC descriptor write with a value the characteristic does not allow.
    CccdImproperlyConfigured = 0xFD,
    ProcedureAlreadyInProgress = 0xFE,
    OutOfRange = 0xFF,
}

crate::impl_display_via_debug! { Opcode, ErrorCode }
