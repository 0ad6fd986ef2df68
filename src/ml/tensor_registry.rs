//! バックエンドテンソルの生存数管理
//!
//! 推論で確保したテンソルを `TensorLease` で包み、ドロップ時に解放済みとして数えます。
//! 成功・失敗どちらの経路でもスコープを抜けた時点で数が戻ります。

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 生存中テンソル数のカウンタ
#[derive(Debug, Clone, Default)]
pub struct TensorRegistry {
    live: Arc<AtomicUsize>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在生存しているテンソル数
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// テンソルを登録し、解放用のリースを返す
    pub fn lease<T>(&self, value: T) -> TensorLease<T> {
        self.live.fetch_add(1, Ordering::SeqCst);
        TensorLease {
            value,
            _release: Release {
                live: Arc::clone(&self.live),
            },
        }
    }
}

/// 登録済みテンソル
///
/// フィールドは宣言順にドロップされるので、テンソル本体を解放してからカウンタを減らす。
#[derive(Debug)]
pub struct TensorLease<T> {
    value: T,
    _release: Release,
}

impl<T> TensorLease<T> {
    /// 中身を取り出す（取り出した時点で所有権は呼び出し側へ移り、登録は解除される）
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for TensorLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[derive(Debug)]
struct Release {
    live: Arc<AtomicUsize>,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_counts_and_releases() {
        let registry = TensorRegistry::new();
        assert_eq!(registry.live(), 0);

        let a = registry.lease(vec![1.0f32; 4]);
        let b = registry.lease(vec![2.0f32; 4]);
        assert_eq!(registry.live(), 2);
        assert_eq!(a.len(), 4);

        drop(a);
        assert_eq!(registry.live(), 1);
        drop(b);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_release_on_error_path() {
        let registry = TensorRegistry::new();

        fn failing(registry: &TensorRegistry) -> Result<(), String> {
            let _input = registry.lease([0u8; 16]);
            Err("forward failed".to_string())
        }

        assert!(failing(&registry).is_err());
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_into_inner_unregisters() {
        let registry = TensorRegistry::new();
        let lease = registry.lease(String::from("tensor"));
        let value = lease.into_inner();
        assert_eq!(value, "tensor");
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_release_on_panic() {
        let registry = TensorRegistry::new();
        let lease = registry.lease(vec![0.0f32; 8]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _output = registry.lease(lease.len());
            let _input = lease.into_inner();
            panic!("forward failed");
        }));

        assert!(result.is_err());
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let registry = TensorRegistry::new();
        let other = registry.clone();
        let _lease = other.lease(1u32);
        assert_eq!(registry.live(), 1);
    }
}
