//! Listing records as served by the upstream source.
//!
//! Upstream returns a JSON array of property objects keyed by a stable
//! `propref`. Display metadata is opaque pass-through; the named base64
//! image fields (`photo1binary`..`photo9binary`, `floorplanbinary`,
//! `epcbinary`) are the heavyweight part this crate splits out and caches
//! separately.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Highest-numbered sequential photo slot.
pub const MAX_PHOTO_SLOTS: u8 = 9;

/// One named image slot of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    /// Sequential photo, 1-based (1 is the main photo).
    Photo(u8),
    FloorPlan,
    Epc,
}

impl ImageSlot {
    /// The slot holding the main photo, fetched with priority on
    /// reconstruction.
    pub fn main_photo() -> Self {
        Self::Photo(1)
    }

    /// A sequential photo slot, `None` outside `1..=9`.
    pub fn photo(index: u8) -> Option<Self> {
        (1..=MAX_PHOTO_SLOTS)
            .contains(&index)
            .then_some(Self::Photo(index))
    }

    /// Every slot, main photo first.
    pub fn all() -> impl Iterator<Item = ImageSlot> {
        (1..=MAX_PHOTO_SLOTS)
            .map(ImageSlot::Photo)
            .chain([ImageSlot::FloorPlan, ImageSlot::Epc])
    }

    /// Every slot except the main photo.
    pub fn secondary() -> impl Iterator<Item = ImageSlot> {
        Self::all().filter(|slot| *slot != Self::main_photo())
    }

    /// Stable segment used in cache keys (`photo3`, `floorplan`, `epc`).
    pub fn key_segment(&self) -> String {
        match self {
            Self::Photo(index) => format!("photo{index}"),
            Self::FloorPlan => "floorplan".to_string(),
            Self::Epc => "epc".to_string(),
        }
    }

    /// Upstream JSON field carrying this slot's base64 payload.
    pub fn field_name(&self) -> String {
        match self {
            Self::Photo(index) => format!("photo{index}binary"),
            Self::FloorPlan => "floorplanbinary".to_string(),
            Self::Epc => "epcbinary".to_string(),
        }
    }

    /// Inverse of [`ImageSlot::key_segment`].
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "floorplan" => Some(Self::FloorPlan),
            "epc" => Some(Self::Epc),
            _ => segment
                .strip_prefix("photo")
                .and_then(|index| index.parse::<u8>().ok())
                .and_then(Self::photo),
        }
    }
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_segment())
    }
}

/// The sparse base64 image payloads of one listing, in upstream field shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSlots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo1binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo2binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo3binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo4binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo5binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo6binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo7binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo8binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo9binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floorplanbinary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epcbinary: Option<String>,
}

impl ImageSlots {
    fn slot_mut(&mut self, slot: ImageSlot) -> Option<&mut Option<String>> {
        match slot {
            ImageSlot::Photo(1) => Some(&mut self.photo1binary),
            ImageSlot::Photo(2) => Some(&mut self.photo2binary),
            ImageSlot::Photo(3) => Some(&mut self.photo3binary),
            ImageSlot::Photo(4) => Some(&mut self.photo4binary),
            ImageSlot::Photo(5) => Some(&mut self.photo5binary),
            ImageSlot::Photo(6) => Some(&mut self.photo6binary),
            ImageSlot::Photo(7) => Some(&mut self.photo7binary),
            ImageSlot::Photo(8) => Some(&mut self.photo8binary),
            ImageSlot::Photo(9) => Some(&mut self.photo9binary),
            ImageSlot::Photo(_) => None,
            ImageSlot::FloorPlan => Some(&mut self.floorplanbinary),
            ImageSlot::Epc => Some(&mut self.epcbinary),
        }
    }

    pub fn get(&self, slot: ImageSlot) -> Option<&str> {
        match slot {
            ImageSlot::Photo(1) => self.photo1binary.as_deref(),
            ImageSlot::Photo(2) => self.photo2binary.as_deref(),
            ImageSlot::Photo(3) => self.photo3binary.as_deref(),
            ImageSlot::Photo(4) => self.photo4binary.as_deref(),
            ImageSlot::Photo(5) => self.photo5binary.as_deref(),
            ImageSlot::Photo(6) => self.photo6binary.as_deref(),
            ImageSlot::Photo(7) => self.photo7binary.as_deref(),
            ImageSlot::Photo(8) => self.photo8binary.as_deref(),
            ImageSlot::Photo(9) => self.photo9binary.as_deref(),
            ImageSlot::Photo(_) => None,
            ImageSlot::FloorPlan => self.floorplanbinary.as_deref(),
            ImageSlot::Epc => self.epcbinary.as_deref(),
        }
    }

    /// Out-of-range photo slots are ignored.
    pub fn set(&mut self, slot: ImageSlot, value: Option<String>) {
        if let Some(place) = self.slot_mut(slot) {
            *place = value;
        }
    }

    pub fn take(&mut self, slot: ImageSlot) -> Option<String> {
        self.slot_mut(slot)?.take()
    }

    /// Slots that currently hold a non-empty payload.
    pub fn present(&self) -> Vec<ImageSlot> {
        ImageSlot::all()
            .filter(|slot| self.get(*slot).is_some_and(|data| !data.is_empty()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }

    /// Drain every non-empty slot, leaving the struct empty.
    pub fn drain(&mut self) -> Vec<(ImageSlot, String)> {
        ImageSlot::all()
            .filter_map(|slot| self.take(slot).map(|data| (slot, data)))
            .filter(|(_, data)| !data.is_empty())
            .collect()
    }
}

/// Slot-load accounting attached to a reconstructed record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    pub loaded: u32,
    pub missing: u32,
}

/// One property as served by upstream, plus the `featured` flag this crate
/// maintains. `id` is immutable once assigned; metadata and image slots may
/// be independently absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(rename = "propref", deserialize_with = "de_listing_id")]
    pub id: String,
    #[serde(default)]
    pub featured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_report: Option<ImageReport>,
    /// Slot segments stripped into the image side-table at store time; what
    /// reconstruction is expected to bring back.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_manifest: Vec<String>,
    #[serde(flatten)]
    pub images: ImageSlots,
    /// Everything else upstream sends (address, price, beds, …) passes
    /// through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ListingRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            featured: false,
            image_report: None,
            image_manifest: Vec::new(),
            images: ImageSlots::default(),
            extra: Map::new(),
        }
    }

    /// Split into a metadata-only record plus the drained image payloads,
    /// recording the drained slots in the manifest.
    pub fn split_images(mut self) -> (ListingRecord, Vec<(ImageSlot, String)>) {
        let images = self.images.drain();
        self.image_manifest = images.iter().map(|(slot, _)| slot.key_segment()).collect();
        (self, images)
    }

    /// Slots the manifest expects reconstruction to restore.
    pub fn manifest_slots(&self) -> Vec<ImageSlot> {
        self.image_manifest
            .iter()
            .filter_map(|segment| ImageSlot::from_segment(segment))
            .collect()
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Upstream proprefs arrive as strings or bare numbers; normalize to string.
fn de_listing_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

/// The full ordered collection as last fetched from upstream. Serialized as
/// a bare JSON array, mirroring the wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingsSnapshot {
    pub records: Vec<ListingRecord>,
}

impl ListingsSnapshot {
    pub fn new(records: Vec<ListingRecord>) -> Self {
        Self { records }
    }

    pub fn find(&self, id: &str) -> Option<&ListingRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One entry of the companion per-listing media-list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub filename: String,
    #[serde(rename = "base64data", default, skip_serializing_if = "Option::is_none")]
    pub base64_data: Option<String>,
    /// Positional or token-based hint; sentinel values mark the floor plan
    /// and EPC certificate, everything else is a sequential photo.
    #[serde(rename = "imgorder", default, skip_serializing_if = "Option::is_none")]
    pub order_hint: Option<String>,
}

impl MediaItem {
    fn is_sentinel(&self, token: &str) -> bool {
        self.order_hint
            .as_deref()
            .is_some_and(|hint| hint.eq_ignore_ascii_case(token))
    }

    /// Content type derived from the filename extension, jpeg by default.
    pub fn content_type(&self) -> String {
        mime_guess::from_path(&self.filename)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "image/jpeg".to_string())
    }
}

/// Map media-list items to image slots: sentinel hints claim the floor-plan
/// and EPC slots, the rest fill sequential photo slots in list order (items
/// past photo 9 are dropped).
pub fn classify_media(items: &[MediaItem]) -> Vec<(ImageSlot, &MediaItem)> {
    let mut next_photo = 1u8;
    let mut classified = Vec::with_capacity(items.len());

    for item in items {
        if item.is_sentinel("FP") {
            classified.push((ImageSlot::FloorPlan, item));
        } else if item.is_sentinel("EPC") {
            classified.push((ImageSlot::Epc, item));
        } else if let Some(slot) = ImageSlot::photo(next_photo) {
            classified.push((slot, item));
            next_photo += 1;
        }
    }

    classified
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(filename: &str, hint: Option<&str>) -> MediaItem {
        MediaItem {
            filename: filename.to_string(),
            base64_data: Some("aGVsbG8=".to_string()),
            order_hint: hint.map(str::to_string),
        }
    }

    #[test]
    fn slot_segments_and_fields() {
        assert_eq!(ImageSlot::Photo(3).key_segment(), "photo3");
        assert_eq!(ImageSlot::Photo(3).field_name(), "photo3binary");
        assert_eq!(ImageSlot::FloorPlan.key_segment(), "floorplan");
        assert_eq!(ImageSlot::Epc.field_name(), "epcbinary");
        assert_eq!(ImageSlot::all().count(), 11);
        assert_eq!(ImageSlot::secondary().count(), 10);
    }

    #[test]
    fn photo_constructor_is_bounded() {
        assert!(ImageSlot::photo(0).is_none());
        assert!(ImageSlot::photo(10).is_none());
        assert_eq!(ImageSlot::photo(9), Some(ImageSlot::Photo(9)));
    }

    #[test]
    fn record_parses_upstream_shape() {
        let record: ListingRecord = serde_json::from_value(serde_json::json!({
            "propref": 1042,
            "displayaddress": "1 Test Street, London",
            "displayprice": "£2,100 pcm",
            "beds": 2,
            "photo1binary": "QUJD",
            "floorplanbinary": "REVG"
        }))
        .expect("record parses");

        assert_eq!(record.id, "1042");
        assert!(!record.featured);
        assert_eq!(record.images.get(ImageSlot::Photo(1)), Some("QUJD"));
        assert_eq!(record.images.get(ImageSlot::FloorPlan), Some("REVG"));
        assert!(record.images.get(ImageSlot::Photo(2)).is_none());
        assert_eq!(
            record.extra.get("displayaddress").and_then(|v| v.as_str()),
            Some("1 Test Street, London")
        );
    }

    #[test]
    fn record_roundtrips_extra_fields() {
        let record: ListingRecord = serde_json::from_value(serde_json::json!({
            "propref": "77",
            "TYPE": "Flat",
            "baths": 1
        }))
        .expect("record parses");

        let value = serde_json::to_value(&record).expect("record serializes");
        assert_eq!(value.get("propref"), Some(&serde_json::json!("77")));
        assert_eq!(value.get("TYPE"), Some(&serde_json::json!("Flat")));
        assert_eq!(value.get("image_report"), None);
    }

    #[test]
    fn split_images_strips_all_slots() {
        let mut record = ListingRecord::new("9");
        record.images.set(ImageSlot::Photo(1), Some("QQ==".to_string()));
        record.images.set(ImageSlot::Epc, Some("Qg==".to_string()));

        let (metadata, images) = record.split_images();
        assert!(!metadata.has_images());
        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|(slot, _)| *slot == ImageSlot::Epc));
        assert_eq!(
            metadata.manifest_slots(),
            vec![ImageSlot::Photo(1), ImageSlot::Epc]
        );
    }

    #[test]
    fn slot_segments_roundtrip() {
        for slot in ImageSlot::all() {
            assert_eq!(ImageSlot::from_segment(&slot.key_segment()), Some(slot));
        }
        assert_eq!(ImageSlot::from_segment("photo0"), None);
        assert_eq!(ImageSlot::from_segment("banner"), None);
    }

    #[test]
    fn classify_media_routes_sentinels_and_sequences() {
        let items = vec![
            media("front.jpg", None),
            media("plan.png", Some("FP")),
            media("cert.pdf", Some("epc")),
            media("kitchen.jpg", Some("2")),
        ];

        let classified = classify_media(&items);
        let slots: Vec<ImageSlot> = classified.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(
            slots,
            vec![
                ImageSlot::Photo(1),
                ImageSlot::FloorPlan,
                ImageSlot::Epc,
                ImageSlot::Photo(2),
            ]
        );
    }

    #[test]
    fn media_content_type_from_extension() {
        assert_eq!(media("a.png", None).content_type(), "image/png");
        assert_eq!(media("a.jpg", None).content_type(), "image/jpeg");
        assert_eq!(media("noext", None).content_type(), "image/jpeg");
    }
}
