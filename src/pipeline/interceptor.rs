/**
 * Optional byte-stream transform applied before parsing (e.g. decompression).
 *
 * Runs on every inbound frame, ahead of JSON parsing and identification.
 */
pub trait MessageInterceptor: Send + Sync {
    fn intercept(&self, raw: Vec<u8>) -> Vec<u8>;
}
