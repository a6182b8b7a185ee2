//! Prime numbers used for sizing the slot array of the hash tables

/// Returns true if the number is prime
pub fn is_prime(number: usize) -> bool {
    if number < 2 {
        return false;
    }
    if number < 4 {
        return true;
    }
    if number % 2 == 0 || number % 3 == 0 {
        return false;
    }
    let mut divisor = 5;
    while divisor <= number / divisor {
        if number % divisor == 0 || number % (divisor + 2) == 0 {
            return false;
        }
        divisor += 6;
    }
    true
}

/// Smallest prime that is larger than or equal to `number`
pub fn next_prime_number(number: usize) -> usize {
    let mut candidate = number.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_prime_number() {
        assert_eq!(next_prime_number(0), 2);
        assert_eq!(next_prime_number(2), 2);
        assert_eq!(next_prime_number(14), 17);
        assert_eq!(next_prime_number(25), 29);
        assert_eq!(next_prime_number(7919), 7919);
        assert!(!is_prime(7917));
    }
}
