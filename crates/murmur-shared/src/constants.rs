/// Application name
pub const APP_NAME: &str = "Murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Number of symbols in a shared message key
pub const KEY_LENGTH: usize = 16;

/// Alphabet shared message keys are drawn from (70 symbols)
pub const KEY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Key derivation context (BLAKE3) mapping a shared key onto cipher key bytes
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "murmur-message-key-v1";

/// Conversation preview shown for encrypted messages
pub const ENCRYPTED_PREVIEW: &str = "🔒 Encrypted Message";

/// Self-destruct durations offered to the sender, in seconds (0 = off)
pub const SELF_DESTRUCT_OPTIONS: [u32; 4] = [0, 5, 60, 3600];

/// Initial size of a conversation's live window, and its growth step
pub const PAGE_SIZE: usize = 20;

/// Delay before a "load more" request actually grows the window
pub const LOAD_MORE_DEBOUNCE_MS: u64 = 500;

/// Idle time after the last keystroke before the typing flag is cleared
pub const TYPING_IDLE_MS: u64 = 2_000;

/// Lifetime of a story
pub const STORY_TTL_HOURS: i64 = 24;

/// Longest story lifetime accepted from configuration (one year)
pub const MAX_STORY_TTL_HOURS: i64 = 24 * 365;

/// How long a single story is shown in the viewer
pub const STORY_SLIDE_MS: u64 = 5_000;

/// Maximum upload size in bytes (50 MiB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Pictures wider than this are scaled down before upload
pub const IMAGE_MAX_WIDTH: u32 = 1920;

/// JPEG quality used when re-encoding pictures (0-100)
pub const IMAGE_JPEG_QUALITY: u8 = 70;

/// Content type of re-encoded pictures
pub const COMPRESSED_IMAGE_TYPE: &str = "image/jpeg";

/// File name and content type of recorded voice clips
pub const VOICE_FILE_NAME: &str = "voice_message.webm";
pub const VOICE_CONTENT_TYPE: &str = "audio/webm";
pub const VOICE_DISPLAY_NAME: &str = "Voice Message";
