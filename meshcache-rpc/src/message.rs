use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Serialize};

use crate::{Status, SCRATCH_SPACE};

/// A type which can be sent across the RPC system.
///
/// This is implemented for any type that can be archived, validated and
/// deserialized again by rkyv, typically by deriving `Archive`, `Serialize`
/// and `Deserialize` with `#[archive(check_bytes)]`.
pub trait Message: Sized + Send + Sync + 'static {
    /// Serializes the message into an aligned buffer.
    fn encode(&self) -> Result<AlignedVec, Status>;

    /// Validates and deserializes the message from an aligned buffer.
    fn decode(buffer: &AlignedVec) -> Result<Self, Status>;
}

impl<T> Message for T
where
    T: Archive + Serialize<AllocSerializer<SCRATCH_SPACE>> + Send + Sync + 'static,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    fn encode(&self) -> Result<AlignedVec, Status> {
        rkyv::to_bytes::<_, SCRATCH_SPACE>(self).map_err(|e| {
            warn!(error = ?e, "Failed to serialize message.");
            Status::internal(format!("Failed to serialize message: {e}"))
        })
    }

    fn decode(buffer: &AlignedVec) -> Result<Self, Status> {
        let archived =
            rkyv::check_archived_root::<T>(buffer).map_err(|_| Status::invalid())?;
        archived
            .deserialize(&mut SharedDeserializeMap::default())
            .map_err(|_| Status::invalid())
    }
}
