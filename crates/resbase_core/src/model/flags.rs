//! Attribute definition flags and query-condition capabilities.

use bitflags::bitflags;

bitflags! {
    /// Behavior flags of one attribute definition.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttributeFlags: u32 {
        /// Stored in the resource metadata row, not in attribute storage.
        const BUILTIN   = 0b0001;
        /// Must carry a non-null value.
        const REQUIRED  = 0b0010;
        /// Settable at creation only.
        const READONLY  = 0b0100;
        /// Computed; never persisted.
        const SYNTHETIC = 0b1000;
    }
}

bitflags! {
    /// Conditions an attribute type can take part in when queries are built.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Conditions: u8 {
        const EQUALITY      = 0b001;
        const COMPARISON    = 0b010;
        const APPROXIMATION = 0b100;
    }
}

impl AttributeFlags {
    /// Concrete attributes have physical storage.
    pub const fn is_concrete(self) -> bool {
        !self.intersects(Self::BUILTIN.union(Self::SYNTHETIC))
    }
}
