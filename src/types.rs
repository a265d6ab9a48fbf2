//! Core data types shared across the scraping pipeline

/// 64-bit perceptual fingerprint of an image (difference hash).
///
/// Two images that differ only by mild resizing or re-encoding collide;
/// visually distinct images do not.
pub type Fingerprint = u64;

/// One search result harvested from the upstream service.
///
/// Lives from emission by the scrape client until a download worker
/// consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestedPin {
    /// Opaque upstream identifier, unique per item
    pub id: String,
    /// HTTPS URL of the original-resolution image
    pub url: String,
}

/// A successfully fetched and decoded image, ready for delivery.
///
/// `bytes` is the encoded payload exactly as downloaded; it is relayed
/// verbatim to subscribers.
#[derive(Debug, Clone)]
pub struct ScrapedImage {
    /// Identifier of the originating pin
    pub id: String,
    /// Perceptual fingerprint of the decoded image
    pub hash: Fingerprint,
    /// Original encoded image payload
    pub bytes: Vec<u8>,
}
