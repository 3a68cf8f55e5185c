use std::fmt;

/// The ordered phases a request goes through.
///
/// Stages run strictly in ascending order. `ReadRequest`, `CreateDocument` and `SendResponse`
/// are single execution stages where the first matching service wins; in every other stage
/// all matching services run in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    ReadRequest = 1,
    ParseRequest = 2,
    CreateDocument = 3,
    ProcessDocument = 4,
    CreateResponse = 5,
    SendResponse = 6,
    Cleanup = 7,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::ReadRequest,
        Stage::ParseRequest,
        Stage::CreateDocument,
        Stage::ProcessDocument,
        Stage::CreateResponse,
        Stage::SendResponse,
        Stage::Cleanup,
    ];

    pub const FIRST: Stage = Stage::ReadRequest;
    pub const LAST: Stage = Stage::Cleanup;

    /// Whether only the first matching service of this stage executes.
    #[inline]
    pub fn is_single_execution(self) -> bool {
        matches!(self, Stage::ReadRequest | Stage::CreateDocument | Stage::SendResponse)
    }

    /// The stage following this one, `None` after [`Stage::Cleanup`].
    #[inline]
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::ReadRequest => "ReadRequest",
            Stage::ParseRequest => "ParseRequest",
            Stage::CreateDocument => "CreateDocument",
            Stage::ProcessDocument => "ProcessDocument",
            Stage::CreateResponse => "CreateResponse",
            Stage::SendResponse => "SendResponse",
            Stage::Cleanup => "Cleanup",
        }
    }

    /// Zero based position of the stage.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::ALL.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(Stage::ReadRequest.next(), Some(Stage::ParseRequest));
        assert_eq!(Stage::SendResponse.next(), Some(Stage::Cleanup));
        assert_eq!(Stage::Cleanup.next(), None);
        assert_eq!(Stage::CreateResponse.index(), 4);
    }

    #[test]
    fn single_execution_stages() {
        let single: Vec<_> = Stage::ALL.into_iter().filter(|stage| stage.is_single_execution()).collect();
        assert_eq!(single, [Stage::ReadRequest, Stage::CreateDocument, Stage::SendResponse]);
    }
}
