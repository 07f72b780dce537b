/// Universal type tags used by LDAP. Deliberately not the full ASN.1 set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum Types {
    Boolean = 1,
    Integer = 2,
    OctetString = 4,
    Null = 5,
    Enumerated = 10,
    Sequence = 16,
    Set = 17,
}
