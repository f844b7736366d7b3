use core::cell::RefCell;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 运行期可配置的线程安全模式，与类型层面的 [`WithMutex`] / [`WithoutMutex`] 一一对应。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadSafetyKind {
    /// 内部互斥锁串行化全部公开操作。
    #[default]
    Guarded,
    /// 单一逻辑所有者，不加锁。
    Unsynchronized,
}

mod sealed {
    pub trait Sealed {}
}

/// 缓冲内部状态的保护方式。
///
/// # 教案式说明
/// - **意图 (Why)**：同一套缓冲逻辑既要服务多线程写入，也要服务单线程拥有者的零锁开销场景；
/// - **逻辑 (How)**：以泛型关联类型 `Cell<T>` 选择容器，`WithMutex` 用 `parking_lot::Mutex`，
///   `WithoutMutex` 用 `RefCell`；后者不实现 `Sync`，跨线程共享在编译期即被拒绝；
/// - **契约 (What)**：[`lock`](Self::lock) 期间内部状态被独占；在回调中重入同一缓冲属于使用错误，
///   `WithMutex` 下表现为死锁，`WithoutMutex` 下表现为 `RefCell` 借用冲突 panic。
pub trait ThreadSafety: sealed::Sealed + 'static {
    const KIND: ThreadSafetyKind;

    type Cell<T>;

    fn new_cell<T>(value: T) -> Self::Cell<T>;

    fn lock<T, R>(cell: &Self::Cell<T>, f: impl FnOnce(&mut T) -> R) -> R;
}

/// 以互斥锁保护，可在线程间共享。
#[derive(Clone, Copy, Debug, Default)]
pub struct WithMutex;

/// 不加锁，仅供单一拥有者使用。
#[derive(Clone, Copy, Debug, Default)]
pub struct WithoutMutex;

impl sealed::Sealed for WithMutex {}
impl sealed::Sealed for WithoutMutex {}

impl ThreadSafety for WithMutex {
    const KIND: ThreadSafetyKind = ThreadSafetyKind::Guarded;

    type Cell<T> = Mutex<T>;

    fn new_cell<T>(value: T) -> Mutex<T> {
        Mutex::new(value)
    }

    fn lock<T, R>(cell: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut cell.lock())
    }
}

impl ThreadSafety for WithoutMutex {
    const KIND: ThreadSafetyKind = ThreadSafetyKind::Unsynchronized;

    type Cell<T> = RefCell<T>;

    fn new_cell<T>(value: T) -> RefCell<T> {
        RefCell::new(value)
    }

    fn lock<T, R>(cell: &RefCell<T>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut cell.borrow_mut())
    }
}
